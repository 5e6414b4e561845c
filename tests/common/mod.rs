//! Scripted in-memory sandbox backend for exercising sessions without
//! namespaces or root.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sandterm::error::{Result, SessionError};
use sandterm::registry::{RegistryConfig, SessionRegistry};
use sandterm::sandbox::{
    OutputChunk, SandboxBackend, SandboxChannel, SandboxHandle, SandboxStatus, StreamKind,
};
use sandterm::sanitize::Framing;
use sandterm::waiter::WaitOptions;
use sandterm::{AppState, Orchestrator};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One thing the scripted program does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Print text.
    Emit(&'static str),
    /// Print raw bytes, bypassing framing.
    EmitRaw(Vec<u8>),
    /// Do nothing for this many milliseconds.
    Pause(u64),
    /// Block until a line of input arrives.
    ReadLine,
    /// Print text with `{}` replaced by the last line read.
    EmitWithInput(&'static str),
    /// Exit with this status, closing the output channel.
    Exit(i32),
    /// Break the output channel with a read error.
    Fail(&'static str),
}

struct Scripted {
    input_tx: mpsc::UnboundedSender<String>,
    input_rx: Option<mpsc::UnboundedReceiver<String>>,
    exit_code: Arc<Mutex<Option<i32>>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct ScriptedBackend {
    script: Vec<Step>,
    framing: Option<Framing>,
    pub fail_create: bool,
    pub fail_attach: bool,
    sandboxes: Mutex<HashMap<String, Scripted>>,
    next_id: AtomicUsize,
    pub created: AtomicUsize,
    pub destroy_calls: AtomicUsize,
    pub inputs: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            ..Default::default()
        }
    }

    pub fn multiplexed(mut self) -> Self {
        self.framing = Some(Framing::Multiplexed);
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.sandboxes.lock().unwrap().len()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }

    fn framing(&self) -> Framing {
        self.framing.unwrap_or(Framing::Demultiplexed)
    }
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = vec![1, 0, 0, 0];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

async fn play(
    script: Vec<Step>,
    framing: Framing,
    output: mpsc::Sender<std::io::Result<OutputChunk>>,
    mut input: mpsc::UnboundedReceiver<String>,
    exit_code: Arc<Mutex<Option<i32>>>,
) {
    let stream = match framing {
        Framing::Multiplexed => StreamKind::Combined,
        Framing::Demultiplexed => StreamKind::Stdout,
    };
    let send = |bytes: Vec<u8>| {
        let output = output.clone();
        async move {
            let _ = output.send(Ok(OutputChunk { stream, bytes })).await;
        }
    };
    let encode = |text: &str| match framing {
        Framing::Multiplexed => frame(text.as_bytes()),
        Framing::Demultiplexed => text.as_bytes().to_vec(),
    };

    let mut last_line = String::new();
    for step in script {
        match step {
            Step::Emit(text) => send(encode(text)).await,
            Step::EmitRaw(bytes) => send(bytes).await,
            Step::Pause(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            Step::ReadLine => match input.recv().await {
                Some(line) => last_line = line.trim_end_matches('\n').to_string(),
                None => return,
            },
            Step::EmitWithInput(template) => send(encode(&template.replace("{}", &last_line))).await,
            Step::Fail(reason) => {
                let error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, reason);
                let _ = output.send(Err(error)).await;
            }
            Step::Exit(code) => {
                *exit_code.lock().unwrap() = Some(code);
                return;
            }
        }
    }
    // No exit step: stay alive with the channel open
    std::future::pending::<()>().await;
}

#[async_trait]
impl SandboxBackend for ScriptedBackend {
    async fn create(&self, _source: &str) -> Result<SandboxHandle> {
        if self.fail_create {
            return Err(SessionError::Creation("scripted create failure".into()));
        }
        let id = format!("box-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        self.sandboxes.lock().unwrap().insert(
            id.clone(),
            Scripted {
                input_tx,
                input_rx: Some(input_rx),
                exit_code: Arc::new(Mutex::new(None)),
                task: None,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxHandle::new(id))
    }

    async fn attach(&self, handle: &SandboxHandle) -> Result<SandboxChannel> {
        if self.fail_attach {
            return Err(SessionError::Attach("scripted attach failure".into()));
        }
        let mut sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get_mut(handle.id())
            .ok_or_else(|| SessionError::Attach(format!("no sandbox {}", handle.id())))?;
        let input = sandbox
            .input_rx
            .take()
            .ok_or_else(|| SessionError::Attach("already attached".into()))?;

        let (tx, rx) = mpsc::channel(64);
        let framing = self.framing();
        sandbox.task = Some(tokio::spawn(play(
            self.script.clone(),
            framing,
            tx,
            input,
            sandbox.exit_code.clone(),
        )));
        Ok(SandboxChannel { output: rx, framing })
    }

    async fn write_input(&self, handle: &SandboxHandle, text: &str) -> Result<()> {
        self.inputs.lock().unwrap().push(text.to_string());
        let sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get(handle.id())
            .ok_or_else(|| SessionError::Stream(format!("no sandbox {}", handle.id())))?;
        sandbox
            .input_tx
            .send(sandterm::sandbox::input_line(text))
            .map_err(|_| SessionError::Stream("stdin closed".into()))
    }

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxStatus> {
        let sandboxes = self.sandboxes.lock().unwrap();
        let sandbox = sandboxes
            .get(handle.id())
            .ok_or_else(|| SessionError::NotFound(handle.id().to_string()))?;
        let code = *sandbox.exit_code.lock().unwrap();
        Ok(match code {
            Some(code) => SandboxStatus::exited(code),
            None => SandboxStatus::running(),
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(sandbox) = self.sandboxes.lock().unwrap().remove(handle.id()) {
            if let Some(task) = sandbox.task {
                task.abort();
            }
        }
        Ok(())
    }
}

/// Short timings so tests finish quickly.
pub fn fast_wait() -> WaitOptions {
    WaitOptions {
        silence: Duration::from_millis(50),
        timeout: Duration::from_millis(300),
        exit_grace: Duration::from_millis(200),
    }
}

pub fn registry(backend: Arc<ScriptedBackend>, lifetime: Duration) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        backend,
        RegistryConfig {
            lifetime,
            sweep_interval: Duration::from_millis(20),
        },
    ))
}

pub fn orchestrator(backend: Arc<ScriptedBackend>) -> Orchestrator {
    Orchestrator::new(
        registry(backend, Duration::from_secs(60)),
        fast_wait(),
        Duration::from_secs(5),
    )
}

pub fn app_state(backend: Arc<ScriptedBackend>) -> AppState {
    AppState::new(
        backend,
        RegistryConfig::default(),
        fast_wait(),
        Duration::from_secs(5),
    )
}

/// Lets spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
