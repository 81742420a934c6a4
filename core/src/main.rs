/// Chatline client - runtime plus local view API
use chatline_core::session::resolve_session;
use chatline_core::{Backend, ChatError, ChatRuntime, Config};
use std::env;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", Config::usage("chatline"));
        return Ok(());
    }
    let mut config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(session) = resolve_session(&config)? else {
        anyhow::bail!(
            "No access token: pass --token, set CHATLINE_TOKEN or run `cli token <api_url> <token>`"
        );
    };
    config.api_url = session.api_url.clone();

    let backend = Backend::new(
        &config.api_url,
        config.ws_url.as_deref(),
        &session.access_token,
        config.request_timeout,
    )?;

    let user = match backend.validate().await {
        Ok(profile) => {
            info!("Signed in as {} (id {})", profile.username, profile.id);
            Some(profile.username)
        }
        Err(ChatError::Backend { status, .. }) if status == 401 || status == 403 => {
            anyhow::bail!("Access token rejected by {} ({})", config.api_url, status)
        }
        Err(e) => {
            warn!("Could not validate session: {}", e);
            None
        }
    };

    info!("Starting chatline");
    info!("   Backend: {}", config.api_url);
    info!("   View API: http://{}", config.view_addr);

    let (runtime, handle) = ChatRuntime::new(&config, backend);
    let mut runtime_task = tokio::spawn(runtime.run());

    let view_handle = handle.clone();
    let view_addr = config.view_addr;
    tokio::spawn(async move {
        if let Err(e) = chatline_core::view_api::start_view_api(view_handle, user, view_addr).await
        {
            error!("View API stopped: {}", e);
        }
    });

    tokio::select! {
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping...");
            let _ = handle.shutdown();
            runtime_task.await??;
        }
        res = &mut runtime_task => {
            res??;
        }
    }

    info!("Chatline stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
