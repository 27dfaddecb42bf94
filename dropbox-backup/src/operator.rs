use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, bail};
use dropbox_core::{DropboxClient, DropboxError, Metadata};

use crate::sync::reconcile::Plan;

/// Line-oriented conversation with whoever runs the backup.
pub struct Operator<R, W> {
    input: R,
    output: W,
}

impl Operator<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> Operator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn say(&mut self, message: &str) -> io::Result<()> {
        writeln!(self.output, "{message}")?;
        self.output.flush()
    }

    pub fn ask(&mut self, prompt: &str) -> io::Result<String> {
        writeln!(self.output, "{prompt}")?;
        self.output.flush()?;
        let mut line = String::new();
        if self.input.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "input closed while waiting for an answer",
            ));
        }
        Ok(line.trim().to_string())
    }

    /// Asks until the answer is y or n.
    pub fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        loop {
            match self.ask(&format!("{prompt} (y/n)"))?.to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => self.say("Invalid response. Trying again.")?,
            }
        }
    }

    pub fn choose_local_root(&mut self, preset: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        let root = match preset {
            Some(root) => root,
            None => PathBuf::from(
                self.ask("Please choose the local folder to store the Dropbox backup:")?,
            ),
        };
        if !root.is_dir() {
            bail!("no valid local directory chosen: {}", root.display());
        }
        Ok(root)
    }

    /// Asks for tokens until one passes the account check or the operator
    /// gives up. `make_client` builds a client for a candidate token.
    pub async fn choose_client<F>(
        &mut self,
        mut preset: Option<String>,
        make_client: F,
    ) -> anyhow::Result<DropboxClient>
    where
        F: Fn(&str) -> Result<DropboxClient, DropboxError>,
    {
        loop {
            let token = match preset.take() {
                Some(token) => token,
                None => self.ask("Please copy and paste the access token below:")?,
            };
            let client = make_client(&token).context("failed to build Dropbox client")?;
            match client.get_current_account().await {
                Ok(account) => {
                    let who = account.email.unwrap_or(account.account_id);
                    self.say(&format!("Token validated for account {who}."))?;
                    return Ok(client);
                }
                Err(err) if err.is_auth() => {
                    self.say("Invalid access token; generate a new one from the app console.")?;
                }
                Err(err) => {
                    tracing::warn!(%err, "account check failed");
                    self.say(&format!("Could not reach Dropbox: {err}"))?;
                }
            }
            if !self.confirm("Try again?")? {
                bail!("no valid access token provided");
            }
        }
    }

    /// Asks for a remote folder until one exists and is a folder. `/` always
    /// qualifies since the API has no metadata for the root.
    pub async fn choose_remote_root(
        &mut self,
        client: &DropboxClient,
        mut preset: Option<String>,
    ) -> anyhow::Result<String> {
        loop {
            let root = match preset.take() {
                Some(root) => root,
                None => self.ask("Please enter the Dropbox folder to back up (/ for everything):")?,
            };
            let root = normalize_remote_root(&root);
            if root == "/" {
                return Ok(root);
            }
            match client.get_metadata(&root).await {
                Ok(Metadata::Folder(folder)) => {
                    return Ok(folder.path_display.unwrap_or(root));
                }
                Ok(_) => self.say(&format!("{root} is not a folder."))?,
                Err(err) if err.is_auth() => {
                    bail!("access token was rejected, please issue a new one: {err}");
                }
                Err(err) => self.say(&format!("Invalid folder {root}: {err}"))?,
            }
            if !self.confirm("Try again?")? {
                bail!("no valid Dropbox folder was chosen");
            }
        }
    }

    pub fn confirm_plan(&mut self, plan: &Plan) -> io::Result<bool> {
        self.say(&format!("Resolved: {}.", plan.summary()))?;
        self.confirm("Continue?")
    }

    pub fn print_plan(&mut self, plan: &Plan) -> io::Result<()> {
        for (from, to) in &plan.moves {
            writeln!(self.output, "move     {from} -> {to}")?;
        }
        for path in &plan.removals {
            writeln!(self.output, "remove   {path}")?;
        }
        for path in &plan.downloads {
            writeln!(self.output, "download {path}")?;
        }
        writeln!(self.output, "Resolved: {}.", plan.summary())?;
        self.output.flush()
    }
}

fn normalize_remote_root(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
