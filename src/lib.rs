pub mod certifiers;
pub mod chaincode;
pub mod client;
pub mod config;
pub mod envelope;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod peer;
pub mod policy;
pub mod queue;
pub mod record;
pub mod schema;
