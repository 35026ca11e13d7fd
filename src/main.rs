//! Signet: OpenID Connect / OAuth 2.0 identity provider.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use clap::{Parser, Subcommand};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use signet::models::{ClientRegistry, RegisterClient};
use signet::storage::{PostgresGateway, SharedGateway};
use signet::{AppState, Config, db, routes};

#[derive(Parser)]
#[command(name = "signet", about = "Signet OpenID Connect provider")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default).
    Serve,
    /// OAuth client management.
    Client {
        #[command(subcommand)]
        action: ClientAction,
    },
}

#[derive(Subcommand)]
enum ClientAction {
    /// Register a client; prints the secret exactly once.
    Create {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Registered redirect URI (repeatable).
        #[arg(long = "redirect-uri", required = true)]
        redirect_uris: Vec<String>,
        /// Allowed scope (repeatable; defaults to all).
        #[arg(long = "scope")]
        scopes: Vec<String>,
        /// Allowed grant type (repeatable; defaults to
        /// authorization_code + refresh_token).
        #[arg(long = "grant-type")]
        grant_types: Vec<String>,
        /// Register a public (PKCE-only) client with no secret.
        #[arg(long)]
        public: bool,
    },
    /// Show a client record.
    Show {
        /// Client ID.
        id: String,
    },
    /// Soft-delete a client.
    Deactivate {
        /// Client ID.
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        None | Some(Commands::Serve) => run_server().await,
        Some(Commands::Client { action }) => run_client_command(action).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Run the HTTP server.
async fn run_server() -> Result<()> {
    info!("Starting Signet");

    let config = Config::from_env().context("failed to load configuration")?;
    info!(port = config.port, issuer = %config.issuer, "Configuration loaded");

    let state = AppState::connect(&config)
        .await
        .context("failed to initialize application state")?;
    state.spawn_sweeper();

    let cors = build_cors_layer(&config);
    let app = routes::app(state).layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind to address")?;

    info!(%addr, "Server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}

fn build_cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ]);

    if config.cors_allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(tower_http::cors::Any);
    }
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    layer.allow_origin(origins)
}

/// Run a client CLI command with a minimal context (gateway only).
async fn run_client_command(action: ClientAction) -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    let pool = db::create_pool(&config).await?;
    db::run_migrations(&pool).await?;
    let gateway: SharedGateway = Arc::new(PostgresGateway::new(pool));
    let registry = ClientRegistry::new(gateway);

    match action {
        ClientAction::Create {
            name,
            redirect_uris,
            scopes,
            grant_types,
            public,
        } => {
            let mut input = RegisterClient {
                name,
                redirect_uris,
                grant_types: vec![
                    "authorization_code".to_string(),
                    "refresh_token".to_string(),
                ],
                response_types: vec!["code".to_string()],
                scopes: vec![
                    "openid".to_string(),
                    "profile".to_string(),
                    "email".to_string(),
                    "offline_access".to_string(),
                ],
                token_endpoint_auth_method: if public {
                    "none".to_string()
                } else {
                    "client_secret_basic".to_string()
                },
            };
            if !scopes.is_empty() {
                input.scopes = scopes;
            }
            if !grant_types.is_empty() {
                input.grant_types = grant_types;
            }

            let created = registry
                .register(input)
                .await
                .map_err(|e| anyhow::anyhow!("registration failed: {e}"))?;
            println!("client_id: {}", created.client.id);
            match created.client_secret {
                Some(secret) => {
                    println!("client_secret: {secret}");
                    println!("(the secret is not stored and cannot be shown again)");
                }
                None => println!("public client; authenticate with PKCE"),
            }
        }
        ClientAction::Show { id } => {
            match registry
                .get_any(&id)
                .await
                .map_err(|e| anyhow::anyhow!("lookup failed: {e}"))?
            {
                Some(client) => {
                    println!("id:            {}", client.id);
                    println!("name:          {}", client.name);
                    println!("active:        {}", client.is_active);
                    println!("auth method:   {}", client.token_endpoint_auth_method);
                    println!("redirect URIs: {}", client.redirect_uris.join(", "));
                    println!("grant types:   {}", client.grant_types.join(", "));
                    println!("scopes:        {}", client.scopes.join(", "));
                }
                None => println!("no client with id {id}"),
            }
        }
        ClientAction::Deactivate { id } => {
            let deactivated = registry
                .deactivate(&id)
                .await
                .map_err(|e| anyhow::anyhow!("deactivation failed: {e}"))?;
            if deactivated {
                println!("client {id} deactivated");
            } else {
                println!("no client with id {id}");
            }
        }
    }

    Ok(())
}
