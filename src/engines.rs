//! Seams for the external database collaborators.
//!
//! The shell fronts two engines it does not implement: a command-template
//! engine that substitutes named values into declarative rules, and a query
//! engine that executes opaque command text. Both are consumed through
//! traits; concrete implementations are injected into the [`Interpreter`]
//! by the embedding application.
//!
//! [`Interpreter`]: crate::Interpreter

use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::session::Session;
use anyhow::Result;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::rc::Rc;

/// Template substitution over a rule file loaded elsewhere: given a rule
/// identifier and a name→value mapping, produce the substituted text.
pub trait TemplateEngine {
    fn substitute(&self, rule: &str, values: &HashMap<String, String>) -> Result<String>;
}

/// Execution of opaque command text, returning textual results or errors.
pub trait QueryEngine {
    fn execute(&self, command: &str) -> Result<String>;
}

/// Factory for the `rule` and `query` builtins, holding the injected
/// engines. When no engine was injected the commands report that and fail.
pub struct EngineCommands {
    template: Option<Rc<dyn TemplateEngine>>,
    query: Option<Rc<dyn QueryEngine>>,
}

impl EngineCommands {
    pub fn new(
        template: Option<Rc<dyn TemplateEngine>>,
        query: Option<Rc<dyn QueryEngine>>,
    ) -> Self {
        Self { template, query }
    }
}

impl CommandFactory for EngineCommands {
    fn try_create(
        &self,
        _session: &Session,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        match name {
            "rule" => Some(Box::new(RuleCommand {
                engine: self.template.clone(),
                args: args.iter().map(|s| s.to_string()).collect(),
            })),
            "query" => Some(Box::new(QueryCommand {
                engine: self.query.clone(),
                args: args.iter().map(|s| s.to_string()).collect(),
            })),
            _ => None,
        }
    }
}

/// `rule NAME key=value ...`: substitute values into a named rule and run
/// the result through the query engine when one is present, otherwise print
/// the substituted text.
struct RuleCommand {
    engine: Option<Rc<dyn TemplateEngine>>,
    args: Vec<String>,
}

impl ExecutableCommand for RuleCommand {
    fn execute(
        self: Box<Self>,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        let Some(engine) = self.engine else {
            writeln!(stdout, "rule: no template engine loaded")?;
            return Ok(1);
        };
        let Some((rule, rest)) = self.args.split_first() else {
            writeln!(stdout, "Usage: rule NAME key=value ...")?;
            return Ok(1);
        };
        let mut values = HashMap::new();
        for pair in rest {
            match pair.split_once('=') {
                Some((k, v)) => {
                    values.insert(k.to_string(), v.to_string());
                }
                None => {
                    writeln!(stdout, "rule: '{}' is not key=value", pair)?;
                    return Ok(1);
                }
            }
        }
        let text = engine.substitute(rule, &values)?;
        writeln!(stdout, "{}", text)?;
        Ok(0)
    }
}

/// `query TEXT`: hand opaque command text to the query engine and print
/// whatever comes back.
struct QueryCommand {
    engine: Option<Rc<dyn QueryEngine>>,
    args: Vec<String>,
}

impl ExecutableCommand for QueryCommand {
    fn execute(
        self: Box<Self>,
        _stdin: &mut dyn Read,
        stdout: &mut dyn Write,
        _session: &mut Session,
    ) -> Result<ExitCode> {
        let Some(engine) = self.engine else {
            writeln!(stdout, "query: no query engine loaded")?;
            return Ok(1);
        };
        if self.args.is_empty() {
            writeln!(stdout, "Usage: query \"command text\"")?;
            return Ok(1);
        }
        let text = self.args.join(" ");
        match engine.execute(&text) {
            Ok(result) => {
                write!(stdout, "{}", result)?;
                if !result.ends_with('\n') {
                    writeln!(stdout)?;
                }
                Ok(0)
            }
            Err(e) => {
                writeln!(stdout, "query: {}", e)?;
                Ok(1)
            }
        }
    }
}
