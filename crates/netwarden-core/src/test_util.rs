//! Scripted collaborators for exercising the engine without touching the host.
//!
//! Used by the unit tests in this crate, by `tests/`, and by the agent crate.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::notify::{Notification, NotifyError, Notifier};
use crate::probe::Reachability;
use crate::relay::{DigitalOutput, Level};

/// Successful exit with the given stdout.
pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Failed exit with the given code and stderr.
pub fn fail(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

struct Rule {
    prefix: String,
    queue: VecDeque<CommandOutput>,
    last: CommandOutput,
}

/// Command runner answering from a script.
///
/// Each rule matches on a prefix of the rendered command line
/// (`program arg1 arg2 ...`); the longest matching prefix wins. Responses
/// registered for the same prefix are served in order and the last one
/// repeats. Unmatched commands succeed with empty output.
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, Instant)>>,
    missing: Mutex<HashSet<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            missing: Mutex::new(HashSet::new()),
        }
    }

    /// Queue `output` for commands starting with `prefix`.
    pub fn on(&self, prefix: &str, output: CommandOutput) -> &Self {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.prefix == prefix) {
            Some(rule) => {
                rule.queue.push_back(output.clone());
                rule.last = output;
            }
            None => rules.push(Rule {
                prefix: prefix.to_string(),
                queue: VecDeque::from([output.clone()]),
                last: output,
            }),
        }
        self
    }

    /// Make `program` look absent from the search path; running it fails to spawn.
    pub fn unavailable(&self, program: &str) -> &Self {
        self.missing.lock().unwrap().insert(program.to_string());
        self
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    /// When the first command line starting with `prefix` ran.
    pub fn first_call_at(&self, prefix: &str) -> Option<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|(c, _)| c.starts_with(prefix))
            .map(|(_, at)| *at)
    }

    /// Number of calls whose command line starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c.starts_with(prefix))
            .count()
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push((line.clone(), Instant::now()));

        if self.missing.lock().unwrap().contains(program) {
            return Err(CommandError::Spawn {
                program: program.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "not found"),
            });
        }

        let mut rules = self.rules.lock().unwrap();
        let best = rules
            .iter_mut()
            .filter(|r| line.starts_with(&r.prefix))
            .max_by_key(|r| r.prefix.len());
        Ok(match best {
            Some(rule) => rule.queue.pop_front().unwrap_or_else(|| rule.last.clone()),
            None => ok(""),
        })
    }

    fn is_available(&self, program: &str) -> bool {
        !self.missing.lock().unwrap().contains(program)
    }
}

/// Reachability answering from a fixed sequence; the last answer repeats.
pub struct ScriptedReachability {
    answers: Mutex<VecDeque<bool>>,
    last: Mutex<bool>,
    polls: Mutex<u32>,
}

impl ScriptedReachability {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        let answers: VecDeque<bool> = answers.into_iter().collect();
        let last = answers.back().copied().unwrap_or(false);
        Self {
            answers: Mutex::new(answers),
            last: Mutex::new(last),
            polls: Mutex::new(0),
        }
    }

    pub fn polls(&self) -> u32 {
        *self.polls.lock().unwrap()
    }
}

impl Reachability for ScriptedReachability {
    async fn is_reachable(&self) -> bool {
        *self.polls.lock().unwrap() += 1;
        let next = self.answers.lock().unwrap().pop_front();
        next.unwrap_or_else(|| *self.last.lock().unwrap())
    }
}

/// Shared view of everything a [`RecordingOutput`] was asked to do.
#[derive(Debug, Default)]
pub struct OutputLog {
    pub levels: Vec<Level>,
    /// When each entry of `levels` was set.
    pub set_at: Vec<Instant>,
    pub cleanups: u32,
}

/// Digital output that records levels instead of driving hardware.
pub struct RecordingOutput {
    log: Arc<Mutex<OutputLog>>,
}

impl RecordingOutput {
    pub fn new() -> (Self, Arc<Mutex<OutputLog>>) {
        let log = Arc::new(Mutex::new(OutputLog::default()));
        (Self { log: log.clone() }, log)
    }
}

impl DigitalOutput for RecordingOutput {
    fn set(&mut self, level: Level) -> io::Result<()> {
        let mut log = self.log.lock().unwrap();
        log.levels.push(level);
        log.set_at.push(Instant::now());
        Ok(())
    }

    fn cleanup(&mut self) -> io::Result<()> {
        self.log.lock().unwrap().cleanups += 1;
        Ok(())
    }
}

/// Notifier that keeps every notification, optionally failing each send.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    fail_with: Option<String>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        match &self.fail_with {
            Some(reason) => Err(NotifyError::Transport(reason.clone())),
            None => Ok(()),
        }
    }
}
