//! Line-oriented module scripts.
//!
//! One directive per line; `#` starts a comment. The format exists to give
//! the bridge observable entry-point behavior (output, blocking, scheduled
//! work, exceptions) without a real bytecode interpreter.
//!
//! ```text
//! # boot banner, then two timers
//! print booting
//! sleep 50
//! schedule 30 print tick
//! schedule 60 throw watchdog expired
//! ```

use std::time::Duration;

/// Deferred action fired by the pump when its delay elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Append a line to the module's output log
    Print(String),
    /// Raise a managed exception
    Throw(String),
}

/// One entry-point step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Append a line to the module's output log
    Print(String),
    /// Block the executing thread (a long-running entry point)
    Sleep(Duration),
    /// Raise a managed exception; later directives never run
    Throw(String),
    /// Queue deferred work for the update pump
    Schedule {
        /// Time until the action fires
        delay: Duration,
        /// What fires
        action: Action,
    },
}

/// Script rejection with the offending line number.
#[derive(Debug, thiserror::Error)]
#[error("line {line}: {reason}")]
pub struct ScriptError {
    /// 1-based source line
    pub line: usize,
    /// What was wrong with it
    pub reason: String,
}

/// A parsed module script.
#[derive(Debug, Clone, Default)]
pub struct Script {
    directives: Vec<Directive>,
}

impl Script {
    /// An empty program (the statically linked placeholder).
    pub fn empty() -> Self {
        Script::default()
    }

    /// The entry-point steps in order.
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Parse script source, rejecting the first malformed line.
    pub fn parse(source: &str) -> Result<Self, ScriptError> {
        let mut directives = Vec::new();
        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            directives.push(parse_directive(text, line)?);
        }
        Ok(Script { directives })
    }
}

fn parse_directive(text: &str, line: usize) -> Result<Directive, ScriptError> {
    let (keyword, rest) = split_word(text);
    match keyword {
        "print" => Ok(Directive::Print(rest.to_string())),
        "throw" => Ok(Directive::Throw(rest.to_string())),
        "sleep" => Ok(Directive::Sleep(parse_millis(rest, line)?)),
        "schedule" => {
            let (delay_text, action_text) = split_word(rest);
            let delay = parse_millis(delay_text, line)?;
            let (verb, payload) = split_word(action_text);
            let action = match verb {
                "print" => Action::Print(payload.to_string()),
                "throw" => Action::Throw(payload.to_string()),
                other => {
                    return Err(ScriptError {
                        line,
                        reason: format!("unknown scheduled action '{}'", other),
                    })
                }
            };
            Ok(Directive::Schedule { delay, action })
        }
        other => Err(ScriptError {
            line,
            reason: format!("unknown directive '{}'", other),
        }),
    }
}

fn split_word(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim_start()),
        None => (text, ""),
    }
}

fn parse_millis(text: &str, line: usize) -> Result<Duration, ScriptError> {
    text.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ScriptError {
            line,
            reason: format!("expected milliseconds, got '{}'", text),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_program() {
        let script = Script::parse(
            "# header\n\
             print hello world\n\
             sleep 50\n\
             \n\
             schedule 30 print tick\n\
             schedule 10 throw oops\n\
             throw done",
        )
        .unwrap();
        assert_eq!(script.directives().len(), 5);
        assert_eq!(
            script.directives()[0],
            Directive::Print("hello world".into())
        );
        assert_eq!(
            script.directives()[2],
            Directive::Schedule {
                delay: Duration::from_millis(30),
                action: Action::Print("tick".into()),
            }
        );
        assert_eq!(script.directives()[4], Directive::Throw("done".into()));
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let script = Script::parse("# only comments\n\n   \n# more").unwrap();
        assert!(script.directives().is_empty());
    }

    #[test]
    fn test_unknown_directive_reports_line() {
        let err = Script::parse("print ok\nfrobnicate 7").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.reason.contains("frobnicate"));
    }

    #[test]
    fn test_bad_delay_rejected() {
        let err = Script::parse("schedule soon print x").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.reason.contains("soon"));
    }
}
