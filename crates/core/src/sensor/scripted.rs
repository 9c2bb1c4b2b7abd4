use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use super::LineTransport;

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

struct ScriptState {
    inbound: VecDeque<String>,
    written: Vec<String>,
    responder: Responder,
    fail_writes: bool,
}

/// In-memory transport that plays the sensor's side of the protocol.
///
/// Clones share the same state, so one handle can feed step lines from
/// another thread while the session owns the other.
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    /// Transport that acknowledges every command the way the firmware does.
    pub fn firmware() -> Self {
        Self::with_responder(firmware_reply)
    }

    /// Transport that never answers.
    pub fn silent() -> Self {
        Self::with_responder(|_| Vec::new())
    }

    pub fn with_responder(responder: impl FnMut(&str) -> Vec<String> + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                inbound: VecDeque::new(),
                written: Vec::new(),
                responder: Box::new(responder),
                fail_writes: false,
            })),
        }
    }

    /// Queues a line as if the sensor had sent it.
    pub fn push_line(&self, line: impl Into<String>) {
        self.lock().inbound.push_back(line.into());
    }

    /// Lines written to the sensor so far.
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    pub fn pending(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Makes every following write fail with `BrokenPipe`.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // A panic in a test responder must not hide the transcript.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LineTransport for ScriptedTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure"));
        }
        state.written.push(line.to_string());
        let replies = (state.responder)(line);
        state.inbound.extend(replies);
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> io::Result<Option<String>> {
        Ok(self.lock().inbound.pop_front())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.lock().inbound.clear();
        Ok(())
    }
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").finish()
    }
}

/// Replies of the wearable's firmware to each command.
pub fn firmware_reply(command: &str) -> Vec<String> {
    let mut parts = command.trim().splitn(2, ',');
    let name = parts.next().unwrap_or_default();
    let value = parts.next();

    let reply = match (name, value) {
        ("RESET", None) => "ACK,RESET".to_string(),
        ("START", None) => "ACK,START".to_string(),
        ("SET_WINDOW", Some(v)) => format!("ACK,WINDOW,{v}"),
        ("SET_STRIDE", Some(v)) => format!("ACK,STRIDE,{v}"),
        ("CAL_WEIGHT", Some(v)) => format!("ACK,CAL_WEIGHT,{v}"),
        _ => "ERR,UNKNOWN".to_string(),
    };
    vec![reply]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firmware_acknowledges_known_commands() {
        assert_eq!(firmware_reply("RESET"), vec!["ACK,RESET"]);
        assert_eq!(firmware_reply("SET_WINDOW,5"), vec!["ACK,WINDOW,5"]);
        assert_eq!(firmware_reply("JUMP"), vec!["ERR,UNKNOWN"]);
    }

    #[test]
    fn clones_share_the_line_queue() {
        let mut transport = ScriptedTransport::silent();
        let feeder = transport.clone();
        feeder.push_line("1,0,100,100");

        let line = transport.read_line(Duration::ZERO).unwrap();
        assert_eq!(line.as_deref(), Some("1,0,100,100"));
        assert_eq!(feeder.pending(), 0);
    }
}
