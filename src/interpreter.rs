use crate::command::{CommandFactory, ExitCode};
use crate::engines::{EngineCommands, QueryEngine, TemplateEngine};
use crate::lexer::{self, Separator, Statement};
use crate::parser;
use crate::redirect;
use crate::session::{PromptMode, Session};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::rc::Rc;

/// The interactive command runner: one dispatch loop iteration per
/// statement.
///
/// Each iteration restores any descriptor redirections left by the previous
/// statement, obtains the next statement (from the pending tail of the
/// current line, or by reading a new one), substitutes `$?` and `$VAR`
/// tokens, extracts and applies redirections, and executes the command: a
/// builtin, an engine command, or an implicit spawn of an executable file.
pub struct Interpreter {
    session: Session,
    commands: Vec<Box<dyn CommandFactory>>,
    editor: Option<DefaultEditor>,
}

impl Interpreter {
    /// Create a new interpreter with a custom set of command factories.
    pub fn new(commands: Vec<Box<dyn CommandFactory>>) -> Self {
        Self {
            session: Session::new(),
            commands,
            editor: None,
        }
    }

    /// The default factories plus the given collaborator engines.
    pub fn with_engines(
        template: Option<Rc<dyn TemplateEngine>>,
        query: Option<Rc<dyn QueryEngine>>,
    ) -> Self {
        use crate::builtin::*;
        use crate::external;
        Self::new(vec![
            Box::new(Factory::<Pwd>::default()),
            Box::new(Factory::<Cd>::default()),
            Box::new(Factory::<Echo>::default()),
            Box::new(Factory::<Exit>::default()),
            Box::new(Factory::<Cat>::default()),
            Box::new(Factory::<Wc>::default()),
            Box::new(Factory::<Grep>::default()),
            Box::new(Factory::<Ls>::default()),
            Box::new(Factory::<Mkdir>::default()),
            Box::new(Factory::<Rm>::default()),
            Box::new(Factory::<Touch>::default()),
            Box::new(Factory::<Stat>::default()),
            Box::new(Factory::<Setenv>::default()),
            Box::new(Factory::<Unsetenv>::default()),
            Box::new(Factory::<Getenv>::default()),
            Box::new(Factory::<EnvList>::default()),
            Box::new(Factory::<Prompt>::default()),
            Box::new(Factory::<Free>::default()),
            Box::new(Factory::<Dup2>::default()),
            Box::new(Factory::<CloseFd>::default()),
            Box::new(Factory::<Spawn>::default()),
            Box::new(Factory::<Source>::default()),
            Box::new(Factory::<Help>::default()),
            Box::new(EngineCommands::new(template, query)),
            Box::new(external::Factory),
        ])
    }

    /// The session object the loop threads through every component.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run a single command invocation by name with arguments.
    ///
    /// Returns the command's exit code, or an error when no factory
    /// recognizes the name.
    pub fn run(&mut self, name: &str, args: &[&str]) -> anyhow::Result<ExitCode> {
        for factory in &self.commands {
            if let Some(cmd) = factory.try_create(&self.session, name, args) {
                let mut stdin = std::io::stdin().lock();
                let mut stdout = std::io::stdout();
                return cmd.execute(&mut stdin, &mut stdout, &mut self.session);
            }
        }
        anyhow::bail!("command not found: {}", name)
    }

    /// Execute every statement of `line`, as if it had been typed.
    ///
    /// Redirections are torn down between statements and after the last one,
    /// so none leaks into the caller.
    pub fn execute_line(&mut self, line: &str) -> ExitCode {
        let mut rest = Some(line.to_string());
        while let Some(text) = rest {
            self.session.saved.restore_all();
            if self.session.should_exit {
                break;
            }
            let (statement, pending) = lexer::split_statement(&text);
            rest = pending;
            let status = self.dispatch(statement);
            self.session.last_status = status;
        }
        self.session.saved.restore_all();
        self.session.last_status
    }

    /// The Read-Eval-Print Loop: runs until end of input or an `exit`
    /// statement.
    pub fn repl(&mut self) -> anyhow::Result<ExitCode> {
        loop {
            // Tear down the previous statement's redirections. This is the
            // entire scoping mechanism.
            self.session.saved.restore_all();
            if self.session.should_exit {
                return Ok(self.session.exit_status);
            }

            let line = match self.next_line()? {
                Some(line) => line,
                None => {
                    println!("\nBye");
                    return Ok(self.session.last_status);
                }
            };

            let (statement, pending) = lexer::split_statement(&line);
            self.session.pending = pending;

            let status = self.dispatch(statement);
            self.session.last_status = status;
        }
    }

    /// Next statement text: the pending tail of the current line when there
    /// is one, otherwise a fresh line from standard input. `None` at end of
    /// input.
    fn next_line(&mut self) -> anyhow::Result<Option<String>> {
        if let Some(pending) = self.session.pending.take() {
            return Ok(Some(pending));
        }

        if redirect::stdin_is_tty() {
            let prompt = self.render_prompt();
            if self.editor.is_none() {
                self.editor = Some(DefaultEditor::new()?);
            }
            let Some(editor) = self.editor.as_mut() else {
                anyhow::bail!("line editor unavailable");
            };
            match editor.readline(&prompt) {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    Ok(Some(line))
                }
                Err(ReadlineError::Interrupted) => Ok(Some(String::new())),
                Err(ReadlineError::Eof) => Ok(None),
                Err(err) => Err(err.into()),
            }
        } else {
            // Standard input is a file or a sourced script: emulate the line
            // discipline byte by byte so a mid-stream descriptor swap never
            // loses buffered input.
            Ok(redirect::read_raw_line()?)
        }
    }

    fn render_prompt(&self) -> String {
        match self.session.prompt {
            PromptMode::Silent => String::new(),
            PromptMode::Fixed => "vmsh> ".to_string(),
            PromptMode::WorkingDir => {
                format!("vmsh:{}> ", self.session.current_dir.to_string_lossy())
            }
        }
    }

    /// Execute one statement: substitute, extract redirections, apply them,
    /// and run the command.
    fn dispatch(&mut self, statement: Statement) -> ExitCode {
        if statement.separator == Separator::Background {
            // No job control on this platform: '&' sequences like ';'.
            log::debug!("'&' separator treated as sequential");
        }
        let mut argv = statement.argv;
        self.substitute_tokens(&mut argv);

        let redirections = match parser::parse_redirections(&mut argv) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("{}", e);
                // The statement is skipped entirely, with no side effects.
                return self.session.last_status;
            }
        };

        if let Err(e) = redirect::apply(&redirections, &mut self.session) {
            eprintln!("{:#}", e);
            return -1;
        }

        let Some((name, args)) = argv.split_first() else {
            // Empty command: the redirections alone were the statement.
            return self.session.last_status;
        };
        let args: Vec<&str> = args.iter().map(|s| s.as_str()).collect();

        for i in 0..self.commands.len() {
            if let Some(cmd) = self.commands[i].try_create(&self.session, name, &args) {
                let status = {
                    let mut stdin = std::io::stdin().lock();
                    let mut stdout = std::io::stdout();
                    let result = cmd.execute(&mut stdin, &mut stdout, &mut self.session);
                    use std::io::Write;
                    let _ = stdout.flush();
                    match result {
                        Ok(status) => status,
                        Err(e) => {
                            eprintln!("{}: {:#}", name, e);
                            1
                        }
                    }
                };
                return status;
            }
        }

        eprintln!("Command '{}' not found", name);
        -1
    }

    /// Token post-processing: a token exactly `$?` becomes the previous
    /// statement's status; a token starting with `$` becomes the named
    /// variable's value, or empty when unset.
    fn substitute_tokens(&self, argv: &mut [String]) {
        for token in argv.iter_mut() {
            if token == "$?" {
                *token = self.session.last_status.to_string();
            } else if let Some(name) = token.strip_prefix('$') {
                if !name.is_empty() {
                    *token = self.session.get_var(name).unwrap_or_default();
                }
            }
        }
    }
}

impl Default for Interpreter {
    /// Create an interpreter with the default command set and no
    /// collaborator engines.
    fn default() -> Self {
        Self::with_engines(None, None)
    }
}
