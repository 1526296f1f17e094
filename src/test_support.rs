//! Scripted session doubles shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::{props, FgcSession, Reply, SessionFactory};
use crate::{Error, Result};

/// One recorded session operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    Get(String),
    Set(String, String),
    Disconnect,
}

pub(crate) type SessionLog = Arc<Mutex<Vec<Op>>>;

/// Scripted [FgcSession]: records every operation, serves queued
/// `FSM.STATE` replies and fixed per-property replies, and can be told to
/// fail on chosen properties.
pub(crate) struct MockSession {
    log: SessionLog,
    states: Arc<Mutex<VecDeque<String>>>,
    default_state: String,
    replies: HashMap<String, String>,
    fail_props: HashSet<String>,
}

impl MockSession {
    pub(crate) fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            states: Arc::new(Mutex::new(VecDeque::new())),
            default_state: "UNKNOWN".to_string(),
            replies: HashMap::new(),
            fail_props: HashSet::new(),
        }
    }

    /// Queue replies for `REGFGC3.PROG.FSM.STATE`, served in order; once
    /// exhausted, the default state is served.
    pub(crate) fn with_states(self, states: &[&str]) -> Self {
        self.states
            .lock()
            .extend(states.iter().map(|s| s.to_string()));
        self
    }

    /// Serve a fixed reply for a property.
    pub(crate) fn with_reply(mut self, property: &str, value: &str) -> Self {
        self.replies.insert(property.to_string(), value.to_string());
        self
    }

    /// Fail every get/set on a property.
    pub(crate) fn with_failing(mut self, property: &str) -> Self {
        self.fail_props.insert(property.to_string());
        self
    }

    /// Handle on the operation log, usable after the session is boxed.
    pub(crate) fn log(&self) -> SessionLog {
        self.log.clone()
    }
}

impl FgcSession for MockSession {
    fn get(&mut self, property: &str) -> Result<Reply> {
        self.log.lock().push(Op::Get(property.to_string()));

        if self.fail_props.contains(property) {
            return Err(Error::rpc(format!("scripted failure on {property}")));
        }

        if property == props::FSM_STATE {
            let value = self
                .states
                .lock()
                .pop_front()
                .unwrap_or_else(|| self.default_state.clone());
            return Ok(Reply::new(value));
        }

        Ok(Reply::new(
            self.replies.get(property).cloned().unwrap_or_default(),
        ))
    }

    fn set(&mut self, property: &str, value: &str) -> Result<()> {
        self.log
            .lock()
            .push(Op::Set(property.to_string(), value.to_string()));

        if self.fail_props.contains(property) {
            return Err(Error::rpc(format!("scripted failure on {property}")));
        }

        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.log.lock().push(Op::Disconnect);
        Ok(())
    }
}

/// [SessionFactory] handing out pre-built [MockSession]s in order.
pub(crate) struct MockFactory {
    sessions: Mutex<VecDeque<MockSession>>,
    connects: AtomicUsize,
}

impl MockFactory {
    pub(crate) fn new(sessions: Vec<MockSession>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl SessionFactory for MockFactory {
    fn connect(&self, _device: &str) -> Result<Box<dyn FgcSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        match self.sessions.lock().pop_front() {
            Some(session) => Ok(Box::new(session)),
            None => Err(Error::rpc("no scripted session left")),
        }
    }
}
