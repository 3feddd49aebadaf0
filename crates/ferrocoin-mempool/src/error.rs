use bitcoin::Txid;

/// Errors reported by the ancestor/descendant package-limit walk.
///
/// Interior mempool operations are infallible; these only surface from
/// `calculate_mem_pool_ancestors` when one of the four limits would be
/// breached.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MempoolError {
    #[error("too many unconfirmed parents [limit: {limit}]")]
    TooManyParents { limit: u64 },

    #[error("exceeds descendant size limit for tx {txid} [limit: {limit}]")]
    ExceedsDescendantSize { txid: Txid, limit: u64 },

    #[error("too many descendants for tx {txid} [limit: {limit}]")]
    TooManyDescendants { txid: Txid, limit: u64 },

    #[error("exceeds ancestor size limit [limit: {limit}]")]
    ExceedsAncestorSize { limit: u64 },

    #[error("too many unconfirmed ancestors [limit: {limit}]")]
    TooManyAncestors { limit: u64 },
}
