//! Drives the real `scriptds-host` binary over its stdin/stdout channel.

use std::io::Write;
use std::process::Stdio;
use std::time::Duration;

use scriptds_runtime::ipc::{
    CallRequest, CallResponse, HostMessage, IpcReader, IpcWriter, LoadRequest, MessageType,
    ResolveRequest,
};
use scriptds_runtime::EngineError;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

const MODULE: &str = r#"
globalThis.runQuery = async (req) => {
    const parsed = JSON.parse(req);
    if (parsed.fail) throw new Error("asked to fail");
    return JSON.stringify({ data: [{ refId: parsed.refId, fields: [] }] });
};
//# sourceMappingURL=module.js.map
"#;

struct Host {
    child: Child,
    reader: IpcReader<ChildStdout>,
    writer: IpcWriter<ChildStdin>,
}

async fn spawn_host(module: &str) -> (Host, tempfile::NamedTempFile) {
    let mut file = tempfile::Builder::new().suffix(".js").tempfile().unwrap();
    file.write_all(module.as_bytes()).unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_scriptds-host"))
        .arg(file.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let writer = IpcWriter::new(child.stdin.take().unwrap());
    let mut reader = IpcReader::new(child.stdout.take().unwrap());

    let ready = tokio::time::timeout(Duration::from_secs(10), reader.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(ready.msg_type, MessageType::Ready);

    (Host { child, reader, writer }, file)
}

impl Host {
    async fn exchange(&mut self, msg: HostMessage) -> HostMessage {
        self.writer.send(&msg).await.unwrap();
        self.reader.recv().await.unwrap().unwrap()
    }

    async fn load_and_resolve(&mut self) {
        let loaded = self
            .exchange(HostMessage::json(MessageType::Load, &LoadRequest { settle_ms: 500 }).unwrap())
            .await;
        assert_eq!(loaded.msg_type, MessageType::Loaded);

        let resolved = self
            .exchange(
                HostMessage::json(
                    MessageType::Resolve,
                    &ResolveRequest {
                        name: "runQuery".into(),
                    },
                )
                .unwrap(),
            )
            .await;
        assert_eq!(resolved.msg_type, MessageType::Resolved);
    }

    async fn call(&mut self, id: u64, request: &str) -> CallResponse {
        let msg = HostMessage::json(
            MessageType::Call,
            &CallRequest {
                id,
                request: request.into(),
                timeout_ms: 5_000,
            },
        )
        .unwrap();
        let reply = self.exchange(msg).await;
        assert_eq!(reply.msg_type, MessageType::Result);
        reply.parse_json().unwrap()
    }
}

#[tokio::test]
async fn test_full_session() {
    let (mut host, _file) = spawn_host(MODULE).await;
    host.load_and_resolve().await;

    let response = host.call(41, r#"{"refId":"A"}"#).await;
    assert_eq!(response.id, 41);
    let text = response.outcome.unwrap();
    assert!(text.contains(r#""refId":"A""#));

    let response = host.call(42, r#"{"refId":"B","fail":true}"#).await;
    assert_eq!(response.id, 42);
    assert!(matches!(response.outcome, Err(EngineError::Rejected(ref r)) if r.contains("asked to fail")));

    host.writer
        .send(&HostMessage::empty(MessageType::Shutdown))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(5), host.child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_missing_entry_is_reported() {
    let (mut host, _file) = spawn_host("const nothingHere = true;").await;
    let loaded = host
        .exchange(HostMessage::json(MessageType::Load, &LoadRequest { settle_ms: 0 }).unwrap())
        .await;
    assert_eq!(loaded.msg_type, MessageType::Loaded);

    let reply = host
        .exchange(
            HostMessage::json(
                MessageType::Resolve,
                &ResolveRequest {
                    name: "runQuery".into(),
                },
            )
            .unwrap(),
        )
        .await;
    assert_eq!(reply.msg_type, MessageType::Error);
    let err: EngineError = reply.parse_json().unwrap();
    assert_eq!(err, EngineError::EntryNotFound("runQuery".into()));
}

#[tokio::test]
async fn test_evaluation_failure_is_reported() {
    let (mut host, _file) = spawn_host("this is not javascript").await;
    let reply = host
        .exchange(HostMessage::json(MessageType::Load, &LoadRequest { settle_ms: 0 }).unwrap())
        .await;
    assert_eq!(reply.msg_type, MessageType::Error);
    let err: EngineError = reply.parse_json().unwrap();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_exits_when_parent_closes_stdin() {
    let (host, _file) = spawn_host(MODULE).await;
    let Host {
        mut child, writer, ..
    } = host;
    drop(writer);
    let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}
