// relay-test-utils: shared test utilities for the relay suite.
//
// Provides a mock socket agent (the remote side of the relay's socket
// transport), a raw test client for the relay's WebSocket edge, and a
// helper for shell-scripted subprocess agents.

pub mod mock_agent;
pub mod test_client;

pub use mock_agent::MockAgentServer;
pub use test_client::TestClient;

/// Build a `(program, args)` pair that runs `script` under `/bin/sh`.
///
/// Transports append their own flags after the script, which the shell
/// receives as positional parameters and ignores.
pub fn script_agent(script: &str) -> (String, Vec<String>) {
    ("/bin/sh".to_owned(), vec!["-c".to_owned(), script.to_owned()])
}
