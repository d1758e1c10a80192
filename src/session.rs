//! Interactive session driver: owns one conversation and its effective
//! settings, runs chat turns and dispatches slash commands.

use crate::config::{ConfigStore, DEFAULT_PROFILE, Field, Overrides, Settings, parse_assignment};
use crate::conversation::{Conversation, Role};
use crate::error::{Error, Result};
use crate::llm::{ChatClient, ChatRequest};
use crate::render::Output;
use std::future::Future;
use tracing::debug;

const MAX_DISPLAY_WIDTH: usize = 50;

const HELP: &str = "\
Commands:
  /help                                  Show this help
  /clear                                 Clear the conversation (keeps system messages)
  /exit                                  Exit
  /system [text]                         Show or replace the system prompt
  /config [key=value]                    Show settings or change one
  /save                                  Save current settings to the active profile
  /reset config                          Reset the active profile to defaults
  /profile [list]                        Show profiles
  /profile use <name>                    Switch profile (created if missing)
  /profile create <name> [--from-current]
  /profile clone <source> <target>
  /profile delete <name>

Anything else is sent to the model.";

const PROFILE_USAGE: &str = "Unknown profile command. Use: /profile [use|list|create|delete|clone]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Session<O: Output> {
    store: ConfigStore,
    client: ChatClient,
    overrides: Overrides,
    settings: Settings,
    conversation: Conversation,
    out: O,
}

impl<O: Output> Session<O> {
    /// Resolve the active profile and seed the conversation with its system prompt.
    pub fn new(
        store: ConfigStore,
        client: ChatClient,
        overrides: Overrides,
        out: O,
    ) -> Result<Self> {
        let settings = store.resolve_with(&store.active_profile(), &overrides)?;
        let conversation = Conversation::with_system_prompt(settings.system_prompt.clone());
        Ok(Self {
            store,
            client,
            overrides,
            settings,
            conversation,
            out,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn output(&self) -> &O {
        &self.out
    }

    pub fn active_profile(&self) -> String {
        self.store.active_profile()
    }

    /// Handle one line of user input, reporting any failure through the output sink.
    pub async fn handle_input<F>(&mut self, line: &str, cancel: F) -> Flow
    where
        F: Future<Output = ()>,
    {
        let line = line.trim();
        if line.is_empty() {
            return Flow::Continue;
        }
        let result = if line.starts_with('/') {
            self.command(line)
        } else {
            self.turn(line, cancel).await.map(|_| Flow::Continue)
        };
        match result {
            Ok(flow) => flow,
            Err(Error::Cancelled) => {
                self.out.info("Response interrupted.");
                Flow::Continue
            }
            Err(e) => {
                self.out.error(&e.to_string());
                Flow::Continue
            }
        }
    }

    /// Send `input` as a user message and stream the reply into the conversation.
    ///
    /// On failure the provisional assistant message is removed; the user
    /// message stays.
    pub async fn turn<F>(&mut self, input: &str, cancel: F) -> Result<String>
    where
        F: Future<Output = ()>,
    {
        if self.settings.api_key.is_empty() {
            return Err(Error::MissingCredential);
        }

        self.conversation.append(Role::User, input);
        let request = ChatRequest::new(&self.conversation, &self.settings, self.settings.stream);
        let reply = self.conversation.begin_reply();

        self.out.reply_start();
        let result = {
            let conversation = &mut self.conversation;
            let out = &mut self.out;
            let mut on_delta = |d: &str| {
                conversation.push_delta(&reply, d);
                out.delta(d);
            };
            self.client
                .execute_until(request, Some(&mut on_delta), cancel)
                .await
        };
        self.out.reply_end();

        match result {
            Ok(text) => {
                self.conversation.commit(reply);
                Ok(text)
            }
            Err(e) => {
                debug!("turn failed, discarding provisional reply: {e}");
                self.conversation.discard(reply);
                Err(e)
            }
        }
    }

    pub fn command(&mut self, line: &str) -> Result<Flow> {
        let line = line.trim();
        let (cmd, args) = line
            .split_once(char::is_whitespace)
            .map(|(c, a)| (c, a.trim()))
            .unwrap_or((line, ""));

        match cmd {
            "/exit" | "/quit" => {
                self.out.info("Goodbye!");
                return Ok(Flow::Exit);
            }
            "/help" => self.out.info(HELP),
            "/clear" => {
                self.conversation.clear();
                self.out.info("Conversation cleared.");
            }
            "/system" => self.system_command(args)?,
            "/config" => self.config_command(args)?,
            "/save" => {
                let profile = self.store.active_profile();
                self.store.persist(&self.settings, &profile)?;
                self.out.info("Configuration saved.");
            }
            "/reset" => self.reset_command(args)?,
            "/profile" => self.profile_command(args)?,
            _ => self.out.error(&format!(
                "Unknown command: {cmd}. Type /help for a list of commands."
            )),
        }
        Ok(Flow::Continue)
    }

    fn system_command(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            match self.conversation.system_prompt() {
                Some(prompt) => {
                    let msg = format!("Current system message:\n{prompt}");
                    self.out.info(&msg);
                }
                None => self.out.info("No system message set."),
            }
            return Ok(());
        }
        self.update(Field::SystemPrompt, args)?;
        self.conversation.set_system_prompt(args);
        self.out.info("System message updated and saved.");
        Ok(())
    }

    fn config_command(&mut self, args: &str) -> Result<()> {
        if args.is_empty() {
            let title = format!("Configuration: {} profile", self.store.active_profile());
            let rows: Vec<(String, String)> = self
                .settings
                .rows()
                .into_iter()
                .map(|(k, v)| (k.to_string(), truncate(&v, MAX_DISPLAY_WIDTH)))
                .collect();
            self.out.table(&title, &rows);
            return Ok(());
        }
        let (field, value) = parse_assignment(args)?;
        self.update(field, &value)?;
        if field == Field::SystemPrompt {
            self.conversation.set_system_prompt(value.clone());
        }
        self.out.info(&format!("Updated {field} to {value}"));
        Ok(())
    }

    fn reset_command(&mut self, args: &str) -> Result<()> {
        if args != "config" {
            self.out.error("Unknown reset target. Use: /reset config");
            return Ok(());
        }
        let profile = self.store.active_profile();
        self.store.reset(&profile)?;
        self.overrides = Overrides::new();
        self.reload()?;
        self.out.info("Configuration reset to defaults.");
        Ok(())
    }

    fn profile_command(&mut self, args: &str) -> Result<()> {
        let parts: Vec<&str> = args.split_whitespace().collect();
        match parts.as_slice() {
            [] => {
                let msg = format!("Current profile: {}", self.store.active_profile());
                self.out.info(&msg);
                self.show_profiles()?;
            }
            ["list"] => self.show_profiles()?,
            ["use", name] => {
                if !self.store.profile_exists(name) && *name != DEFAULT_PROFILE {
                    self.out.info(&format!(
                        "Profile '{name}' does not exist. Creating new profile."
                    ));
                }
                self.store.set_active(name)?;
                self.switched_profile()?;
                self.out.info(&format!("Switched to profile: {name}"));
            }
            ["create", name] => {
                self.store.persist(&Settings::default(), name)?;
                self.out.info(&format!("Created new profile: {name}"));
            }
            ["create", name, "--from-current"] => {
                self.store.persist(&self.settings, name)?;
                self.out.info(&format!("Created new profile: {name}"));
            }
            ["clone", source, target] => {
                self.store.clone_profile(source, target)?;
                self.out.info(&format!("Cloned profile '{source}' to '{target}'"));
            }
            ["delete", name] => {
                if *name == DEFAULT_PROFILE {
                    self.out.error("Cannot delete the default profile.");
                    return Ok(());
                }
                let was_active = self.store.active_profile() == *name;
                if self.store.delete(name)? {
                    self.out.info(&format!("Deleted profile: {name}"));
                    if was_active {
                        self.switched_profile()?;
                    }
                } else {
                    self.out.error(&format!("Profile '{name}' does not exist."));
                }
            }
            _ => self.out.error(PROFILE_USAGE),
        }
        Ok(())
    }

    fn show_profiles(&mut self) -> Result<()> {
        let active = self.store.active_profile();
        let rows: Vec<(String, String)> = self
            .store
            .list_profiles()?
            .into_iter()
            .map(|p| {
                let status = if p == active { "ACTIVE" } else { "" };
                (p, status.to_string())
            })
            .collect();
        self.out.table("Configuration Profiles", &rows);
        Ok(())
    }

    /// Persist one field to the active profile. The edit supersedes any
    /// runtime override or environment value of that field until the next
    /// profile switch or reset.
    fn update(&mut self, field: Field, value: &str) -> Result<()> {
        let profile = self.store.active_profile();
        self.store.update_field(field, value, &profile)?;
        self.overrides.remove(field);
        self.settings.set(field, value)
    }

    fn reload(&mut self) -> Result<()> {
        self.settings = self
            .store
            .resolve_with(&self.store.active_profile(), &self.overrides)?;
        Ok(())
    }

    /// Reload after the active profile changed and adopt its system prompt.
    fn switched_profile(&mut self) -> Result<()> {
        self.reload()?;
        let prompt = self.settings.system_prompt.clone();
        self.conversation.set_system_prompt(prompt);
        Ok(())
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        return value.to_string();
    }
    let kept: String = value.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}
