//! Commands sent to the runtime worker thread.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::engine::CallId;
use crate::error::EngineError;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// One step of the load -> resolve -> call -> await sequence.
pub(crate) enum RuntimeCommand {
    /// Evaluate the module body.
    Load {
        body: String,
        settle: Duration,
        reply: Reply<()>,
    },

    /// Look up the entry function by name.
    ResolveEntry { name: String, reply: Reply<()> },

    /// Invoke the entry function with the serialized request.
    Call {
        entry: String,
        request: String,
        reply: Reply<CallId>,
    },

    /// Drain the event loop until the call settles.
    Await {
        call: CallId,
        timeout: Duration,
        reply: Reply<String>,
    },
}
