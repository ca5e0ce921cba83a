pub mod build;
pub mod deploy;
pub mod pac;
pub mod remove;
pub mod run;

use std::io::Write as _;
use std::path::PathBuf;

use is_terminal::IsTerminal as _;

use crate::docker::creds::{
    ChooseHelperFn, CredentialChain, Credentials, CredsError, PromptFn, PushPermissionVerifier,
};

/// The function root a command operates on.
pub fn function_root(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

/// The default credential chain: file loaders, push-permission
/// verification, and interactive prompts when attached to a terminal.
pub fn credential_chain() -> CredentialChain<PushPermissionVerifier> {
    let mut chain = CredentialChain::with_default_loaders(PushPermissionVerifier::default());
    if std::io::stdin().is_terminal() {
        chain = chain
            .prompt(terminal_credentials_prompt())
            .choose_helper(terminal_helper_prompt());
    }
    chain
}

fn terminal_credentials_prompt() -> PromptFn {
    Box::new(|registry| {
        eprintln!("Please provide credentials for {registry}.");
        let username = read_line("Username: ")?;
        let password = read_line("Password: ")?;
        Ok(Credentials::new(username, password))
    })
}

fn terminal_helper_prompt() -> ChooseHelperFn {
    Box::new(|available| {
        if available.is_empty() {
            return Ok(None);
        }
        eprintln!(
            "Choose a credential helper to store the verified credentials [{}] (empty to skip):",
            available.join(", ")
        );
        let choice = read_line("Helper: ")?;
        if choice.is_empty() {
            return Ok(None);
        }
        if !available.iter().any(|h| *h == choice) {
            eprintln!("'{choice}' is not on PATH; not persisting");
            return Ok(None);
        }
        Ok(Some(choice))
    })
}

fn read_line(prompt: &str) -> Result<String, CredsError> {
    prompt_line(prompt).map_err(|e| CredsError::Io(std::io::Error::other(e)))
}

/// Prompt on stderr and read one trimmed line from stdin.
pub fn prompt_line(prompt: &str) -> anyhow::Result<String> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
