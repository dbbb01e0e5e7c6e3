//! Scripted channel used by unit tests of command-driven platforms

use crate::domain::ports::CommandChannel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Out(String),
    Fail { status: i32, stderr: String },
}

struct Rule {
    endpoint: String,
    needle: String,
    replies: VecDeque<Reply>,
}

/// Answers commands by substring match; the last reply of a rule repeats.
/// Unmatched commands succeed with empty output.
#[derive(Default)]
pub(crate) struct ScriptedChannel {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on(&self, endpoint: &str, needle: &str, stdout: &str) -> &Self {
        self.on_seq(endpoint, needle, vec![Reply::Out(stdout.to_string())])
    }

    pub(crate) fn fail(&self, endpoint: &str, needle: &str, status: i32, stderr: &str) -> &Self {
        self.on_seq(
            endpoint,
            needle,
            vec![Reply::Fail {
                status,
                stderr: stderr.to_string(),
            }],
        )
    }

    pub(crate) fn on_seq(&self, endpoint: &str, needle: &str, replies: Vec<Reply>) -> &Self {
        self.rules.lock().push(Rule {
            endpoint: endpoint.to_string(),
            needle: needle.to_string(),
            replies: replies.into(),
        });
        self
    }

    /// Rendered commands sent so far, as `endpoint: command`
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|(e, c)| format!("{}: {}", e, c))
            .collect()
    }

    pub(crate) fn count_matching(&self, needle: &str) -> usize {
        self.calls.lock().iter().filter(|(_, c)| c.contains(needle)).count()
    }
}

#[async_trait]
impl CommandChannel for ScriptedChannel {
    async fn send(&self, endpoint: &str, argv: &[String]) -> Result<String> {
        let command = argv.join(" ");
        self.calls.lock().push((endpoint.to_string(), command.clone()));

        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| r.endpoint == endpoint && command.contains(&r.needle));

        let reply = match rule {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front(),
            Some(rule) => rule.replies.front().cloned(),
            None => None,
        };

        match reply {
            Some(Reply::Out(out)) => Ok(out),
            Some(Reply::Fail { status, stderr }) => Err(Error::Command {
                endpoint: endpoint.to_string(),
                command,
                status,
                stderr,
            }),
            None => Ok(String::new()),
        }
    }
}
