use std::env;
use std::sync::Mutex;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use pow_ledger::api;
use pow_ledger::blockchain::{self, Blockchain, LedgerConfig};

const DEFAULT_BIND: &str = "127.0.0.1:8080";

fn load_config() -> anyhow::Result<LedgerConfig> {
    match env::var("LEDGER_CONFIG") {
        Ok(path) => {
            info!("Loading ledger configuration from {}", path);
            LedgerConfig::from_json_file(&path)
                .with_context(|| format!("invalid ledger configuration in {}", path))
        }
        Err(_) => Ok(LedgerConfig::default()),
    }
}

// Open the ledger on disk if a data directory is set, otherwise keep it in memory
fn initialize_blockchain(config: LedgerConfig) -> anyhow::Result<Blockchain> {
    let data_dir = match env::var("LEDGER_DATA_DIR") {
        Ok(dir) => dir,
        Err(_) => {
            warn!("LEDGER_DATA_DIR not set, creating in-memory blockchain");
            return Blockchain::new(config).context("failed to create blockchain");
        }
    };

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir))?;

    let blockchain = Blockchain::with_storage(config, &data_dir)
        .with_context(|| format!("failed to load blockchain from {}", data_dir))?;
    info!(
        "Loaded blockchain from storage at {} (height {})",
        data_dir,
        blockchain.block_height()
    );

    Ok(blockchain)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_block,
        api::handlers::get_pending_transactions,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::validate_chain,
        api::handlers::create_wallet,
        api::handlers::register_wallet,
        api::handlers::get_wallet_balance,
        api::handlers::get_balances
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::TransactionKind,
            blockchain::Address,
            blockchain::DigitalSignature,
            api::handlers::ChainResponse,
            api::handlers::TransactionRequest,
            api::handlers::TransactionResponse,
            api::handlers::MineRequest,
            api::handlers::MineResponse,
            api::handlers::ValidationResponse,
            api::handlers::WalletResponse,
            api::handlers::RegisterRequest,
            api::handlers::RegisterResponse,
            api::handlers::BalanceResponse
        )
    ),
    tags(
        (name = "ledger", description = "Proof-of-work ledger API endpoints")
    ),
    info(
        title = "Ledger API",
        version = "0.1.0",
        description = "A single-node proof-of-work ledger"
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = load_config()?;
    info!(
        "Difficulty {}, minimum fee {}, reward policy {:?}",
        config.difficulty, config.minimum_fee, config.reward_policy
    );

    let ledger: api::LedgerData = web::Data::new(Mutex::new(initialize_blockchain(config)?));
    let bind = env::var("LEDGER_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());

    info!("Starting HTTP server at http://{}", bind);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(ledger.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", ApiDoc::openapi()),
            )
    })
    .bind(&bind)
    .with_context(|| format!("failed to bind {}", bind))?
    .run()
    .await?;

    Ok(())
}
