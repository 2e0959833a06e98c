use std::str::FromStr;
use std::sync::Mutex;

use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::{Address, Block, Blockchain, Transaction, Wallet};

/// Shared ledger state
pub type LedgerData = web::Data<Mutex<Blockchain>>;

fn error_body(message: impl Into<String>) -> serde_json::Value {
    serde_json::json!({ "error": message.into() })
}

/// Runs `f` against the locked ledger on the blocking pool.
///
/// Mining holds the lock for the whole nonce search, so no handler waits for
/// it on an async worker.
async fn with_ledger<F, R>(ledger: LedgerData, f: F) -> Result<R, HttpResponse>
where
    F: FnOnce(&mut Blockchain) -> R + Send + 'static,
    R: Send + 'static,
{
    let result = web::block(move || -> Result<R, &'static str> {
        let mut blockchain = ledger.lock().map_err(|_| "Ledger lock poisoned")?;
        Ok(f(&mut *blockchain))
    })
    .await;

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(reason)) => {
            error!("{}", reason);
            Err(HttpResponse::InternalServerError().json(error_body("Ledger unavailable")))
        }
        Err(err) => {
            error!("Ledger task failed: {}", err);
            Err(HttpResponse::InternalServerError().json(error_body("Ledger task failed")))
        }
    }
}

fn parse_address(raw: &str, field: &str) -> Result<Address, HttpResponse> {
    Address::from_str(raw).map_err(|err| {
        HttpResponse::BadRequest().json(error_body(format!("Invalid {}: {}", field, err)))
    })
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// The sender's address
    pub sender: String,

    /// The recipient's address
    pub recipient: String,

    /// The amount to transfer
    pub amount: f64,

    /// The transaction fee
    pub fee: f64,

    /// The sender's private key (for signing)
    pub private_key: String,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    /// The message
    pub message: String,

    /// Height of the block that will include this transaction
    pub block_height: usize,

    /// The signed transaction as it sits in the pool
    pub transaction: Transaction,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineRequest {
    /// The miner's address
    pub miner_address: String,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidationResponse {
    pub is_valid: bool,

    /// First integrity violation, if any
    pub error: Option<String>,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

/// Request for the register wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterRequest {
    pub address: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RegisterResponse {
    /// False if the wallet was already registered
    pub registered: bool,

    /// Block reward after the registration
    pub block_reward: f64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,

    pub balance: f64,
}

/// Get the full blockchain
///
/// Returns the entire blockchain and its validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_chain(ledger: LedgerData) -> impl Responder {
    let response = with_ledger(ledger, |blockchain| ChainResponse {
        length: blockchain.chain().len(),
        chain: blockchain.chain().to_vec(),
        is_valid: blockchain.is_chain_valid(),
    })
    .await;

    match response {
        Ok(response) => HttpResponse::Ok().json(response),
        Err(response) => response,
    }
}

/// Get a block by height
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{height}",
    params(("height" = usize, Path, description = "Block height, genesis is 0")),
    responses(
        (status = 200, description = "Block retrieved successfully", body = Block),
        (status = 404, description = "No block at this height")
    )
)]
pub async fn get_block(ledger: LedgerData, height: web::Path<usize>) -> impl Responder {
    let height = height.into_inner();
    let lookup = with_ledger(ledger, move |blockchain| {
        blockchain
            .block_at_height(height)
            .cloned()
            .ok_or_else(|| blockchain.block_height())
    })
    .await;

    match lookup {
        Ok(Ok(block)) => HttpResponse::Ok().json(block),
        Ok(Err(tip)) => HttpResponse::NotFound().json(error_body(format!(
            "No block at height {}, chain height is {}",
            height, tip
        ))),
        Err(response) => response,
    }
}

/// Get all pending transactions
///
/// Returns all transactions waiting to be included in a block
#[utoipa::path(
    get,
    path = "/api/v1/transactions/pending",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_pending_transactions(ledger: LedgerData) -> impl Responder {
    match with_ledger(ledger, |blockchain| blockchain.pending_transactions().to_vec()).await {
        Ok(pending) => HttpResponse::Ok().json(pending),
        Err(response) => response,
    }
}

/// Create a new transaction
///
/// Signs a transfer with the sender's key and adds it to the pending pool
#[utoipa::path(
    post,
    path = "/api/v1/transactions/new",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction created successfully", body = TransactionResponse),
        (status = 400, description = "Invalid or rejected transaction"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn new_transaction(
    ledger: LedgerData,
    transaction_req: web::Json<TransactionRequest>,
) -> impl Responder {
    let wallet = match Wallet::from_secret_hex(&transaction_req.private_key) {
        Ok(wallet) => wallet,
        Err(err) => {
            return HttpResponse::BadRequest()
                .json(error_body(format!("Invalid private key: {}", err)));
        }
    };

    // Check if the wallet address matches the sender address
    if wallet.address().as_str() != transaction_req.sender {
        return HttpResponse::BadRequest()
            .json(error_body("Private key does not match sender address"));
    }

    let mut transaction = Transaction::transfer(
        wallet.address().clone(),
        Address::from(transaction_req.recipient.as_str()),
        transaction_req.amount,
        transaction_req.fee,
    );

    if let Err(err) = transaction.sign(&wallet) {
        return HttpResponse::BadRequest()
            .json(error_body(format!("Failed to sign transaction: {}", err)));
    }

    let submitted = with_ledger(ledger, move |blockchain| {
        blockchain
            .submit_transaction(transaction)
            .map(|transaction| (transaction, blockchain.block_height() + 1))
    })
    .await;

    match submitted {
        Ok(Ok((transaction, block_height))) => HttpResponse::Created().json(TransactionResponse {
            message: format!("Transaction will be added to block {}", block_height),
            block_height,
            transaction,
        }),
        Ok(Err(reason)) => HttpResponse::BadRequest()
            .json(error_body(format!("Failed to add transaction: {}", reason))),
        Err(response) => response,
    }
}

/// Mine a new block
///
/// Mines the pending pool into a block and queues the miner's reward
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = MineRequest,
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 400, description = "Invalid miner address"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(ledger: LedgerData, mine_req: web::Json<MineRequest>) -> impl Responder {
    let miner_address = match parse_address(&mine_req.miner_address, "miner address") {
        Ok(address) => address,
        Err(response) => return response,
    };

    let mined = with_ledger(ledger, move |blockchain| blockchain.mine_block(&miner_address)).await;

    match mined {
        Ok(Ok(block)) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block,
        }),
        Ok(Err(err)) => {
            error!("Failed to mine block: {}", err);
            HttpResponse::InternalServerError()
                .json(error_body(format!("Failed to mine block: {}", err)))
        }
        Err(response) => response,
    }
}

/// Check if the blockchain is valid
///
/// Validates the entire blockchain
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(ledger: LedgerData) -> impl Responder {
    let validation = match with_ledger(ledger, |blockchain| blockchain.validate_chain()).await {
        Ok(validation) => validation,
        Err(response) => return response,
    };

    let response = match validation {
        Ok(()) => ValidationResponse {
            is_valid: true,
            error: None,
        },
        Err(err) => ValidationResponse {
            is_valid: false,
            error: Some(err.to_string()),
        },
    };

    HttpResponse::Ok().json(response)
}

/// Create a new wallet
///
/// Creates a new wallet with a random keypair
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse)
    )
)]
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::generate();

    HttpResponse::Created().json(WalletResponse {
        address: wallet.address().to_string(),
        private_key: wallet.secret_key_hex(),
    })
}

/// Register a wallet for airdrops
#[utoipa::path(
    post,
    path = "/api/v1/wallet/register",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Registration processed", body = RegisterResponse),
        (status = 400, description = "Invalid address"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn register_wallet(
    ledger: LedgerData,
    register_req: web::Json<RegisterRequest>,
) -> impl Responder {
    let address = match parse_address(&register_req.address, "address") {
        Ok(address) => address,
        Err(response) => return response,
    };

    let registration = with_ledger(ledger, move |blockchain| {
        blockchain
            .register_wallet(address)
            .map(|registered| RegisterResponse {
                registered,
                block_reward: blockchain.block_reward(),
            })
    })
    .await;

    match registration {
        Ok(Ok(response)) => HttpResponse::Ok().json(response),
        Err(response) => response,
        Ok(Err(err)) => {
            error!("Failed to register wallet: {}", err);
            HttpResponse::InternalServerError()
                .json(error_body(format!("Failed to register wallet: {}", err)))
        }
    }
}

/// Get wallet balance
///
/// Returns the balance of a wallet, replayed from the chain
#[utoipa::path(
    get,
    path = "/api/v1/wallet/balance/{address}",
    params(("address" = String, Path, description = "Hex encoded wallet address")),
    responses(
        (status = 200, description = "Wallet balance retrieved successfully", body = BalanceResponse)
    )
)]
pub async fn get_wallet_balance(ledger: LedgerData, address: web::Path<String>) -> impl Responder {
    let address = Address(address.into_inner());
    let queried = address.clone();

    match with_ledger(ledger, move |blockchain| blockchain.get_balance(&queried)).await {
        Ok(balance) => HttpResponse::Ok().json(BalanceResponse {
            address: address.0,
            balance,
        }),
        Err(response) => response,
    }
}

/// Get all balances
///
/// Returns the balance of every address that appears on the chain
#[utoipa::path(
    get,
    path = "/api/v1/balances",
    responses(
        (status = 200, description = "Balances retrieved successfully", body = Vec<BalanceResponse>)
    )
)]
pub async fn get_balances(ledger: LedgerData) -> impl Responder {
    let balances = match with_ledger(ledger, |blockchain| blockchain.balances()).await {
        Ok(balances) => balances,
        Err(response) => return response,
    };

    let balances: Vec<BalanceResponse> = balances
        .into_iter()
        .map(|(address, balance)| BalanceResponse {
            address: address.0,
            balance,
        })
        .collect();

    HttpResponse::Ok().json(balances)
}
