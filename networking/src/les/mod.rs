/// On-demand retrieval for light clients.
///
/// A light client keeps only verified headers and fetches everything else
/// from light servers when it is needed:
///
/// - **ServerPool**: known servers, their quality scores and dial backoff
/// - **RetrieveManager**: sends a request to servers until one answers with
///   data that passes validation
/// - **OdrRequest**: a typed query and the check that makes any answer
///   trustworthy
/// - **LesOdr**: state, receipt, body, header and bloom bit queries built on
///   top of the retriever and the trusted section roots
/// - **ChtIndexer**: derives CHT section roots from local headers
pub mod config;
pub mod error;
pub mod indexer;
pub mod odr;
pub mod request;
pub mod retrieve;
pub mod server_pool;

pub use config::LesConfig;
pub use error::{IndexError, OdrError, RetrieveError, ValidationError};
pub use indexer::ChtIndexer;
pub use odr::LesOdr;
pub use request::{
    AccountRequest, BloomBitsRequest, BlockBodyRequest, ChtRequest, ContractCodeRequest,
    OdrRequest, ProvenAccount, ProvenHeader, ReceiptsRequest,
};
pub use retrieve::RetrieveManager;
pub use server_pool::{les_topic, ServerPool};

#[cfg(test)]
mod tests;
