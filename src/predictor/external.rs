//! Bridge to the external predictor collaborator.
//!
//! The non-`llsp` backends live in a Python package named `predictor`
//! that exposes `create` / `fit` / `predict`. One collaborator process is
//! spawned lazily per shim process (`python3 -u -m predictor`, with
//! `PYTHONPATH` prefixed by the working directory so a local
//! `predictor.py` is found), and every model instance is a numbered handle
//! inside it. Requests and replies are single lines of JSON.
//!
//! A model that cannot answer poisons every later prediction, so any
//! spawn, protocol, or decode failure here is fatal to the process.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::extract::NR_METRICS;
use crate::predictor::PredictorKind;

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request<'a> {
    Create { kind: &'a str, metrics: usize },
    Fit { id: u64, x: &'a [f64], y: f64 },
    Predict { id: u64, x: &'a [f64] },
}

#[derive(Deserialize)]
struct CreateReply {
    id: u64,
}

#[derive(Deserialize)]
struct PredictReply {
    value: f64,
}

#[derive(Deserialize)]
struct FitReply {
    #[allow(dead_code)]
    ok: bool,
}

struct Collaborator {
    _child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

static COLLABORATOR: OnceLock<Mutex<Collaborator>> = OnceLock::new();

fn fatal(what: &str, err: &dyn std::fmt::Display) -> ! {
    log::error!("external predictor {}: {}", what, err);
    std::process::exit(1);
}

impl Collaborator {
    fn spawn() -> Collaborator {
        let python_path = match std::env::var("PYTHONPATH") {
            Ok(existing) => format!(".:{}", existing),
            Err(_) => ".".to_string(),
        };

        let mut child = Command::new("python3")
            .args(["-u", "-m", "predictor"])
            .env("PYTHONPATH", python_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap_or_else(|e| fatal("failed to start", &e));

        let stdin = child.stdin.take().expect("collaborator stdin was piped");
        let stdout = child.stdout.take().expect("collaborator stdout was piped");

        Collaborator {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout),
        }
    }

    fn round_trip<R: for<'de> Deserialize<'de>>(&mut self, request: &Request) -> R {
        let mut line =
            serde_json::to_string(request).unwrap_or_else(|e| fatal("request encoding", &e));
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .unwrap_or_else(|e| fatal("request write", &e));

        let mut reply = String::new();
        match self.stdout.read_line(&mut reply) {
            Ok(0) => fatal("reply read", &"collaborator closed its end"),
            Ok(_) => {}
            Err(e) => fatal("reply read", &e),
        }
        serde_json::from_str(&reply).unwrap_or_else(|e| fatal("reply decoding", &e))
    }
}

fn with_collaborator<R: for<'de> Deserialize<'de>>(request: &Request) -> R {
    let cell = COLLABORATOR.get_or_init(|| Mutex::new(Collaborator::spawn()));
    let mut guard = match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.round_trip(request)
}

/// A model handle inside the collaborator process.
pub struct ExternalModel {
    id: u64,
}

impl ExternalModel {
    pub fn create(kind: PredictorKind) -> ExternalModel {
        let reply: CreateReply = with_collaborator(&Request::Create {
            kind: kind.name(),
            metrics: NR_METRICS,
        });
        ExternalModel { id: reply.id }
    }

    pub fn predict(&mut self, features: &[f64; NR_METRICS]) -> f64 {
        let reply: PredictReply = with_collaborator(&Request::Predict {
            id: self.id,
            x: features,
        });
        reply.value
    }

    pub fn fit(&mut self, features: &[f64; NR_METRICS], observed: f64) {
        let _: FitReply = with_collaborator(&Request::Fit {
            id: self.id,
            x: features,
            y: observed,
        });
    }
}
