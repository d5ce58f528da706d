use serde::Serialize;
use tokio::sync::oneshot;

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "terminal", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Terminal {
    Succeeded,
    Failed,
    /// The orchestrator broke; distinct from the workflow failing.
    Fault(String),
}

/// Sending half of a run's completion signal.
///
/// Resolving consumes the inner `oneshot::Sender`, so a signal releases its
/// waiter at most once; later calls report `false` and change nothing.
#[derive(Debug)]
pub struct TerminalSignal {
    sender: Option<oneshot::Sender<Terminal>>,
}

/// Receiving half; the submitter blocks on it until the run is terminal.
#[derive(Debug)]
pub struct TerminalWaiter {
    receiver: oneshot::Receiver<Terminal>,
}

pub fn terminal_signal() -> (TerminalSignal, TerminalWaiter) {
    let (sender, receiver) = oneshot::channel();
    (
        TerminalSignal {
            sender: Some(sender),
        },
        TerminalWaiter { receiver },
    )
}

impl TerminalSignal {
    pub fn resolve(&mut self, terminal: Terminal) -> bool {
        match self.sender.take() {
            Some(sender) => {
                // The waiter may already be gone; the run is terminal either way.
                let _ = sender.send(terminal);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.is_none()
    }
}

impl TerminalWaiter {
    pub async fn wait(self) -> Terminal {
        self.receiver.await.unwrap_or_else(|_| {
            Terminal::Fault("run was dropped before reaching a terminal phase".to_string())
        })
    }

    /// Non-blocking check, used once the driving task has finished.
    pub fn try_take(mut self) -> Option<Terminal> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_resolves_exactly_once() {
        let (mut signal, waiter) = terminal_signal();
        assert!(!signal.is_resolved());
        assert!(signal.resolve(Terminal::Failed));
        assert!(!signal.resolve(Terminal::Succeeded));
        assert!(signal.is_resolved());
        assert_eq!(waiter.wait().await, Terminal::Failed);
    }

    #[tokio::test]
    async fn test_dropped_signal_is_a_fault() {
        let (signal, waiter) = terminal_signal();
        drop(signal);
        assert!(matches!(waiter.wait().await, Terminal::Fault(_)));
    }

    #[test]
    fn test_try_take_before_resolution_is_empty() {
        let (_signal, waiter) = terminal_signal();
        assert_eq!(waiter.try_take(), None);
    }
}
