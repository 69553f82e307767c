//! Consent prompts
//!
//! The broker asks a [`ConsentPrompt`] whenever a unit touches a dangerous
//! resource with no usable decision on record. The call blocks the asking
//! unit until the user answers. Embedders with a GUI implement the trait
//! against their dialog system; the terminal prompt and the test doubles
//! here cover everything else.

use std::io::{self, BufRead, Write};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::classifier::{DangerCategory, ResourceRequest};

/// Error type for prompt operations
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Non-interactive environment")]
    NonInteractive,

    #[error("No consent surface available: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What the user is asked about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    /// Requesting code unit id
    pub unit_id: String,
    pub resource_key: String,
    pub category: DangerCategory,
    pub description: String,
    /// Short phrase naming what is being accessed
    pub alias: String,
}

impl ConsentRequest {
    pub fn new(unit_id: impl Into<String>, request: &ResourceRequest) -> Self {
        Self {
            unit_id: unit_id.into(),
            resource_key: request.resource_key.clone(),
            category: request.category,
            description: request.description.clone(),
            alias: request.alias.clone(),
        }
    }
}

/// Answer from the consent collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsentResponse {
    Allow,
    #[default]
    Deny,
    /// Closed without an answer; treated as deny
    Dismissed,
}

impl ConsentResponse {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Blocking user-consent collaborator
pub trait ConsentPrompt: Send + Sync {
    /// Ask the user and wait for the answer
    fn prompt(&self, request: &ConsentRequest) -> Result<ConsentResponse, PromptError>;

    /// Whether a human can actually be asked
    fn is_interactive(&self) -> bool;
}

// ============================================================================
// Terminal Prompt
// ============================================================================

/// Asks on the controlling terminal; anything but "y" denies
#[derive(Debug)]
pub struct TerminalPrompt {
    verbose: bool,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self { verbose: true }
    }

    /// Omit the category description
    pub fn minimal() -> Self {
        Self { verbose: false }
    }

    fn format_request(&self, request: &ConsentRequest) -> String {
        let mut lines = vec![
            format!("Plugin:      {}", request.unit_id),
            format!("Module:      {}", request.resource_key),
        ];
        if self.verbose {
            lines.push(format!(
                "Description: {} ({})",
                request.description, request.category
            ));
        }
        lines.join("\n")
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsentPrompt for TerminalPrompt {
    fn prompt(&self, request: &ConsentRequest) -> Result<ConsentResponse, PromptError> {
        if !atty_check() {
            return Err(PromptError::NonInteractive);
        }

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        writeln!(stdout)?;
        writeln!(
            stdout,
            "Security Verification: \"{}\" wants to access {}",
            request.unit_id, request.alias
        )?;
        writeln!(stdout)?;
        writeln!(stdout, "{}", self.format_request(request))?;
        writeln!(stdout)?;
        write!(stdout, "Allow? [y]es / [N]o: ")?;
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            return Ok(ConsentResponse::Dismissed);
        }

        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(ConsentResponse::Allow),
            "n" | "no" => Ok(ConsentResponse::Deny),
            "" => Ok(ConsentResponse::Deny),
            _ => {
                writeln!(stdout, "Invalid input, defaulting to deny")?;
                Ok(ConsentResponse::Deny)
            }
        }
    }

    fn is_interactive(&self) -> bool {
        atty_check()
    }
}

// ============================================================================
// Auto Prompt
// ============================================================================

/// Answers every request the same way without asking anyone
#[derive(Debug)]
pub struct AutoPrompt {
    response: ConsentResponse,
}

impl AutoPrompt {
    pub fn always_allow() -> Self {
        Self {
            response: ConsentResponse::Allow,
        }
    }

    pub fn always_deny() -> Self {
        Self {
            response: ConsentResponse::Deny,
        }
    }

    pub fn with_response(response: ConsentResponse) -> Self {
        Self { response }
    }
}

impl ConsentPrompt for AutoPrompt {
    fn prompt(&self, _request: &ConsentRequest) -> Result<ConsentResponse, PromptError> {
        Ok(self.response)
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

// ============================================================================
// Unavailable Prompt
// ============================================================================

/// No consent surface at all; every prompt fails
#[derive(Debug, Default)]
pub struct UnavailablePrompt;

impl ConsentPrompt for UnavailablePrompt {
    fn prompt(&self, _request: &ConsentRequest) -> Result<ConsentResponse, PromptError> {
        Err(PromptError::Unavailable("no active window".to_string()))
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

// ============================================================================
// Callback Prompt
// ============================================================================

type PromptFn = dyn Fn(&ConsentRequest) -> Result<ConsentResponse, PromptError> + Send + Sync;

/// Adapts a closure, e.g. a GUI dialog call
pub struct CallbackPrompt {
    callback: Box<PromptFn>,
    interactive: bool,
}

impl CallbackPrompt {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&ConsentRequest) -> Result<ConsentResponse, PromptError> + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
            interactive: true,
        }
    }

    pub fn non_interactive(mut self) -> Self {
        self.interactive = false;
        self
    }
}

impl ConsentPrompt for CallbackPrompt {
    fn prompt(&self, request: &ConsentRequest) -> Result<ConsentResponse, PromptError> {
        (self.callback)(request)
    }

    fn is_interactive(&self) -> bool {
        self.interactive
    }
}

impl std::fmt::Debug for CallbackPrompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackPrompt")
            .field("interactive", &self.interactive)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Recording Prompt (for testing)
// ============================================================================

/// Records every prompt and answers from a script
///
/// Scripted responses are consumed in order; once exhausted the default
/// response is used.
#[derive(Debug, Default)]
pub struct RecordingPrompt {
    prompts: Mutex<Vec<ConsentRequest>>,
    script: Mutex<Vec<ConsentResponse>>,
    response: ConsentResponse,
    delay: Option<Duration>,
}

impl RecordingPrompt {
    pub fn new(response: ConsentResponse) -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            script: Mutex::new(Vec::new()),
            response,
            delay: None,
        }
    }

    /// Answer with these responses first, in order
    pub fn with_script(self, responses: impl IntoIterator<Item = ConsentResponse>) -> Self {
        let mut script: Vec<_> = responses.into_iter().collect();
        script.reverse();
        *self.script.lock().unwrap_or_else(|e| e.into_inner()) = script;
        self
    }

    /// Block for `delay` before answering, like a user reading the dialog
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<ConsentRequest> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl ConsentPrompt for RecordingPrompt {
    fn prompt(&self, request: &ConsentRequest) -> Result<ConsentResponse, PromptError> {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        Ok(scripted.unwrap_or(self.response))
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

impl<P: ConsentPrompt + ?Sized> ConsentPrompt for std::sync::Arc<P> {
    fn prompt(&self, request: &ConsentRequest) -> Result<ConsentResponse, PromptError> {
        (**self).prompt(request)
    }

    fn is_interactive(&self) -> bool {
        (**self).is_interactive()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Check if stdout is connected to a terminal
fn atty_check() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: isatty is safe to call with any file descriptor
        unsafe { libc::isatty(std::io::stdout().as_raw_fd()) != 0 }
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::System::Console::{GetConsoleMode, CONSOLE_MODE};
        let handle = std::io::stdout().as_raw_handle();
        let mut mode: CONSOLE_MODE = 0;
        // SAFETY: GetConsoleMode is safe with valid handle
        unsafe { GetConsoleMode(handle as _, &mut mode) != 0 }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::env::var("TERM").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConsentRequest {
        ConsentRequest::new(
            "reader",
            &ResourceRequest::new("fs", DangerCategory::Filesystem),
        )
    }

    #[test]
    fn test_response() {
        assert!(ConsentResponse::Allow.is_allowed());
        assert!(!ConsentResponse::Deny.is_allowed());
        assert!(!ConsentResponse::Dismissed.is_allowed());
    }

    #[test]
    fn test_auto_prompt() {
        let prompt = AutoPrompt::always_allow();
        assert_eq!(prompt.prompt(&request()).unwrap(), ConsentResponse::Allow);

        let prompt = AutoPrompt::always_deny();
        assert_eq!(prompt.prompt(&request()).unwrap(), ConsentResponse::Deny);
        assert!(!prompt.is_interactive());
    }

    #[test]
    fn test_unavailable_prompt() {
        assert!(matches!(
            UnavailablePrompt.prompt(&request()),
            Err(PromptError::Unavailable(_))
        ));
    }

    #[test]
    fn test_recording_prompt_script() {
        let prompt = RecordingPrompt::new(ConsentResponse::Deny)
            .with_script([ConsentResponse::Allow, ConsentResponse::Dismissed]);

        assert_eq!(prompt.prompt(&request()).unwrap(), ConsentResponse::Allow);
        assert_eq!(prompt.prompt(&request()).unwrap(), ConsentResponse::Dismissed);
        assert_eq!(prompt.prompt(&request()).unwrap(), ConsentResponse::Deny);
        assert_eq!(prompt.prompt_count(), 3);
        assert_eq!(prompt.prompts()[0].unit_id, "reader");
    }

    #[test]
    fn test_callback_prompt() {
        let prompt = CallbackPrompt::new(|req| {
            Ok(if req.category == DangerCategory::Filesystem {
                ConsentResponse::Allow
            } else {
                ConsentResponse::Deny
            })
        });
        assert!(prompt.prompt(&request()).unwrap().is_allowed());
    }

    #[test]
    fn test_format_request() {
        let formatted = TerminalPrompt::new().format_request(&request());
        assert!(formatted.contains("reader"));
        assert!(formatted.contains("fs"));
        assert!(formatted.contains("Filesystem"));

        let minimal = TerminalPrompt::minimal().format_request(&request());
        assert!(!minimal.contains("Filesystem"));
    }
}
