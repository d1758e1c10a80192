use std::io::{self, Write};

/// Where the session driver sends everything user-visible.
pub trait Output {
    /// A reply is about to be streamed.
    fn reply_start(&mut self) {}
    fn delta(&mut self, text: &str);
    fn reply_end(&mut self) {}
    fn info(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
    fn table(&mut self, title: &str, rows: &[(String, String)]);
}

/// Plain line-oriented terminal output: replies and info on stdout, errors on stderr.
#[derive(Debug, Default)]
pub struct TerminalOutput;

impl TerminalOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Output for TerminalOutput {
    fn reply_start(&mut self) {
        print!("\nAssistant: ");
        let _ = io::stdout().flush();
    }

    fn delta(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn reply_end(&mut self) {
        println!("\n");
    }

    fn info(&mut self, msg: &str) {
        println!("{msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("Error: {msg}");
    }

    fn table(&mut self, title: &str, rows: &[(String, String)]) {
        println!("{title}");
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            println!("  {key:<width$}  {value}");
        }
    }
}
