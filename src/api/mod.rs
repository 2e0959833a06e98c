// API module
//
// REST surface over one ledger shared behind a mutex

pub mod handlers;
pub mod routes;

// Re-export main components for easier access
pub use handlers::LedgerData;
pub use routes::configure_routes;
