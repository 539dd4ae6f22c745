use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console_session::{
    FileStore, HttpConnector, SessionConfig, SessionError, SessionManager, SessionSnapshot,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_STORE_FILE: &str = "console-session.json";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("not signed in; run `console login` first")]
    NotSignedIn,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "console", about = "Admin console session CLI")]
struct Cli {
    /// Instance URL used for login and registration.
    #[arg(long, env = "CONSOLE_URL", default_value = "http://127.0.0.1:7272")]
    url: String,

    /// Session file; defaults to `console-session.json` in the temp dir.
    #[arg(long, env = "CONSOLE_STORE_PATH")]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with email and password.
    Login {
        email: String,
        #[arg(long, env = "CONSOLE_PASSWORD")]
        password: String,
    },
    /// Sign in with a pre-issued token.
    LoginToken { token: String },
    Logout,
    /// Create an account without signing in.
    Register {
        email: String,
        #[arg(long, env = "CONSOLE_PASSWORD")]
        password: String,
    },
    Status,
    /// Fetch console settings (admins only).
    Settings,
    /// Show, set, or clear the selected model.
    Model {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        clear: bool,
    },
    /// Keep the session alive, refreshing tokens until Ctrl-C.
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store_path = cli.store.unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_STORE_FILE));
    let config = SessionConfig::from_env();
    let manager = SessionManager::new(
        Arc::new(HttpConnector::new(config.timeouts)),
        Arc::new(FileStore::open(store_path)),
        config,
    );
    manager.initialize();

    let result = run(&manager, &cli.url, cli.command).await;
    manager.shutdown();
    result
}

async fn run(manager: &SessionManager, url: &str, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login { email, password } => {
            let outcome = manager.login(&email, &password, url).await?;
            print_json(&json!({ "success": outcome.success, "userRole": outcome.user_role }))
        }
        Command::LoginToken { token } => {
            let outcome = manager.login_with_token(&token, url).await?;
            print_json(&json!({ "success": outcome.success, "userRole": outcome.user_role }))
        }
        Command::Logout => {
            manager.logout().await;
            println!("signed out");
            Ok(())
        }
        Command::Register { email, password } => {
            manager.register(&email, &password, url).await?;
            println!("registered {email}");
            Ok(())
        }
        Command::Status => print_json(&status_json(&manager.snapshot())),
        Command::Settings => {
            if !manager.is_authenticated() {
                return Err(CliError::NotSignedIn);
            }
            let settings = manager.app_settings().await?;
            print_json(&serde_json::to_value(settings)?)
        }
        Command::Model { name, clear } => {
            if clear {
                manager.set_selected_model(None);
            } else if let Some(name) = name {
                manager.set_selected_model(Some(&name));
            }
            print_json(&json!({ "selectedModel": manager.selected_model() }))
        }
        Command::Watch => run_watch(manager).await,
    }
}

async fn run_watch(manager: &SessionManager) -> Result<(), CliError> {
    if !manager.is_authenticated() {
        return Err(CliError::NotSignedIn);
    }
    let mut updates = manager.subscribe();
    print_json(&status_json(&updates.borrow_and_update()))?;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                return Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let snapshot = updates.borrow_and_update().clone();
                print_json(&status_json(&snapshot))?;
                if !snapshot.is_authenticated() {
                    eprintln!("session ended");
                    return Ok(());
                }
            }
        }
    }
}

fn status_json(snapshot: &SessionSnapshot) -> Value {
    json!({
        "authenticated": snapshot.is_authenticated(),
        "email": snapshot.auth.email,
        "userRole": snapshot.auth.user_role,
        "viewMode": snapshot.view_mode,
        "superUser": snapshot.is_super_user(),
        "deploymentUrl": snapshot.deployment.as_ref().map(|d| d.deployment_url.as_str()),
        "selectedModel": snapshot.selected_model,
        "connected": snapshot.has_client,
    })
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use console_session::{AuthState, Deployment, UserRole, ViewMode};

    #[test]
    fn parses_login_with_password_flag() {
        let cli = Cli::try_parse_from(["console", "--url", "https://c.example.com", "login", "a@b.c", "--password", "pw"])
            .unwrap();
        assert_eq!(cli.url, "https://c.example.com");
        assert!(matches!(cli.command, Command::Login { ref email, ref password } if email == "a@b.c" && password == "pw"));
    }

    #[test]
    fn model_clear_conflicts_with_name() {
        assert!(Cli::try_parse_from(["console", "model", "gpt-4o", "--clear"]).is_err());
    }

    #[test]
    fn status_reports_effective_super_user() {
        let snapshot = SessionSnapshot {
            auth: AuthState::authenticated("a@b.c", UserRole::Admin),
            view_mode: ViewMode::User,
            deployment: Some(Deployment::new("https://c.example.com")),
            selected_model: None,
            ready: true,
            has_client: true,
        };
        let status = status_json(&snapshot);
        assert_eq!(status["userRole"], "admin");
        assert_eq!(status["viewMode"], "user");
        assert_eq!(status["superUser"], false);
        assert_eq!(status["deploymentUrl"], "https://c.example.com");
    }
}
