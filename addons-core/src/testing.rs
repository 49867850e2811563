//! Test doubles: a clock that never really sleeps and a runner that replays
//! scripted outputs.

use std::{
    collections::VecDeque,
    io::{Read, Write},
    net::{SocketAddr, TcpListener},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{
    command::{BackgroundProcess, CommandOutput, CommandRunner, CommandSpec},
    error::Result,
    poll::Clock,
};

#[derive(Debug)]
pub(crate) struct FakeClock {
    origin: Instant,
    state: Mutex<(Duration, Vec<Duration>)>,
}

impl FakeClock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            state: Mutex::new((Duration::ZERO, Vec::new())),
        }
    }

    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub(crate) fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().1.clone()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().unwrap().0
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.0 += duration;
        state.1.push(duration);
    }
}

/// Replays queued outputs in order and records every spec it was asked to
/// run. When the queue is empty it answers with an empty success.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRunner {
    responses: Mutex<VecDeque<Result<CommandOutput>>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, response: Result<CommandOutput>) -> &Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    pub(crate) fn ok(&self, stdout: &str) -> &Self {
        self.push(Ok(CommandOutput::ok(stdout)))
    }

    pub(crate) fn fail(&self, code: i32, stderr: &str) -> &Self {
        self.push(Ok(CommandOutput::failed(code, stderr)))
    }

    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls rendered as `program arg arg…` strings.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<BackgroundProcess> {
        self.calls.lock().unwrap().push(spec.clone());
        Ok(BackgroundProcess::detached(spec.program.clone()))
    }
}

/// Serves one canned `(status, body)` response per accepted connection on a
/// loopback port.
pub(crate) fn serve_http(responses: Vec<(u16, &'static str)>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for (status, body) in responses {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf);
            let reply = format!(
                "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(reply.as_bytes()).unwrap();
        }
    });
    addr
}
