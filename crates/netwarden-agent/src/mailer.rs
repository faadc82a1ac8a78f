//! Email delivery of cycle reports through `curl`'s SMTP support.
//!
//! Credentials never appear on the command line: they go into a private
//! curl config file handed over with `-K`. The body is passed as a file part
//! so arbitrary report text needs no shell or form escaping.

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;

use netwarden_core::command::CommandRunner;
use netwarden_core::notify::{Notification, Notifier, NotifyError};

pub const DEFAULT_SMTP_SERVER: &str = "smtp.gmail.com";
pub const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub user: String,
    pub password: String,
    pub to: String,
    pub server: String,
    pub port: u16,
    /// Implicit TLS (`smtps://`); otherwise STARTTLS is required.
    pub use_ssl: bool,
}

impl MailSettings {
    /// Read settings from `EMAIL_*` / `SMTP_*` variables.
    pub fn from_env() -> Result<Self, NotifyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, NotifyError> {
        let required = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let (Some(user), Some(password), Some(to)) = (
            required("EMAIL_USER"),
            required("EMAIL_PASS"),
            required("EMAIL_TO"),
        ) else {
            return Err(NotifyError::NotConfigured(
                "EMAIL_USER, EMAIL_PASS and EMAIL_TO must be set".to_string(),
            ));
        };

        let port = match get("SMTP_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                NotifyError::NotConfigured(format!("SMTP_PORT is not a port number: {raw}"))
            })?,
            None => DEFAULT_SMTP_PORT,
        };

        Ok(Self {
            user,
            password,
            to,
            server: get("SMTP_SERVER").unwrap_or_else(|| DEFAULT_SMTP_SERVER.to_string()),
            port,
            use_ssl: matches!(get("EMAIL_USE_SSL").as_deref(), Some("1" | "true" | "True")),
        })
    }

    fn url(&self) -> String {
        let scheme = if self.use_ssl { "smtps" } else { "smtp" };
        format!("{scheme}://{}:{}", self.server, self.port)
    }
}

pub struct CurlMailer<R> {
    runner: Arc<R>,
    settings: Option<MailSettings>,
}

impl<R: CommandRunner> CurlMailer<R> {
    /// `settings` is `None` when mail is not configured; every send then
    /// fails with [`NotifyError::NotConfigured`].
    pub fn new(runner: Arc<R>, settings: Option<MailSettings>) -> Self {
        Self { runner, settings }
    }
}

impl<R: CommandRunner> Notifier for CurlMailer<R> {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let Some(settings) = &self.settings else {
            return Err(NotifyError::NotConfigured(
                "EMAIL_USER, EMAIL_PASS and EMAIL_TO must be set".to_string(),
            ));
        };

        let credentials = private_file(&format!(
            "user = \"{}\"\n",
            config_escape(&format!("{}:{}", settings.user, settings.password))
        ))?;
        let body = private_file(&notification.body)?;

        let mut args: Vec<String> = vec![
            "--silent".into(),
            "--show-error".into(),
            "-K".into(),
            credentials.path().display().to_string(),
            "--url".into(),
            settings.url(),
        ];
        if !settings.use_ssl {
            args.push("--ssl-reqd".into());
        }
        args.extend([
            "--mail-from".into(),
            settings.user.clone(),
            "--mail-rcpt".into(),
            settings.to.clone(),
            "-H".into(),
            format!("Subject: {}", notification.subject),
            "-H".into(),
            format!("From: {}", settings.user),
            "-H".into(),
            format!("To: {}", settings.to),
            "-F".into(),
            format!("=<{};type=text/plain", form_quote(&body.path().display().to_string())),
        ]);
        for attachment in &notification.attachments {
            let name = attachment
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            args.push("-F".into());
            args.push(format!(
                "=@{};type=application/octet-stream;filename={}",
                form_quote(&attachment.display().to_string()),
                form_quote(&name)
            ));
        }

        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self
            .runner
            .run("curl", &argv)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !out.success() {
            return Err(NotifyError::Transport(format!(
                "curl exited with {}: {}",
                out.code(),
                out.stderr.trim()
            )));
        }
        tracing::debug!(to = %settings.to, "mail accepted by server");
        Ok(())
    }
}

/// Temporary file readable only by this user, removed on drop.
fn private_file(contents: &str) -> Result<NamedTempFile, NotifyError> {
    let write = || -> std::io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(file)
    };
    write().map_err(|e| NotifyError::Transport(format!("stage mail: {e}")))
}

/// Escape a value for a double-quoted curl config string.
fn config_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Quote a word for a curl `-F` value so `;`, `,` and quotes stay literal.
fn form_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
