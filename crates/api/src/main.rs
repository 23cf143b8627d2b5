use std::sync::Arc;

use loomerp_auth::{Rs256Verifier, VerifierConfig};

#[tokio::main]
async fn main() {
    loomerp_observability::init();

    let verifier_config = match VerifierConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "verifier configuration invalid");
            std::process::exit(1);
        }
    };
    let verifier = Arc::new(Rs256Verifier::new(verifier_config));

    let services = Arc::new(loomerp_api::app::build_services());
    let app = loomerp_api::app::build_app(services, verifier);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8000")
        .await
        .expect("failed to bind 0.0.0.0:8000");

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app).await.unwrap();
}
