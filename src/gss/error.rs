//! Error taxonomy for the RPCSEC_GSS processor.
//!
//! Failures either map to an RPC-level auth error in a MSG_DENIED reply, to
//! an encoded init failure, or to a silent discard (below-window replays per
//! RFC 2203 §5.3.3.1).

use thiserror::Error;

use crate::protocol::xdr::rpc::auth_stat;

#[derive(Debug, Error)]
pub enum GssError {
    /// No context for the presented handle; the client must re-establish.
    #[error("no context for the presented handle")]
    CredProblem,

    /// The context exists but can no longer be used and must be destroyed.
    #[error("context is no longer usable: {0}")]
    CtxProblem(String),

    /// The request must be dropped without any reply.
    #[error("request silently discarded")]
    SilentDiscard,

    /// A token failed structural validation.
    #[error("malformed token: {0}")]
    BadToken(String),

    /// MIC or wrap-token integrity verification failed.
    #[error("integrity check failed")]
    IntegrityFailure,

    /// Unwrapping an encrypted body failed.
    #[error("privacy unwrap failed: {0}")]
    PrivacyFailure(String),

    /// The verifier rejected the AP-REQ during context establishment.
    #[error("context establishment failed: {0}")]
    Defective(String),

    /// Key material did not match the negotiated etype.
    #[error("bad key material: {0}")]
    BadKey(String),

    /// Principal could not be mapped to a local identity.
    #[error("identity mapping failed: {0}")]
    IdentityMapping(String),
}

impl GssError {
    /// RPC auth status for failures that produce a MSG_DENIED reply.
    ///
    /// Silent discards never reach this; the processor short-circuits them.
    pub fn auth_stat(&self) -> auth_stat {
        match self {
            GssError::CredProblem => auth_stat::RPCSEC_GSS_CREDPROBLEM,
            GssError::CtxProblem(_) => auth_stat::RPCSEC_GSS_CTXPROBLEM,
            GssError::SilentDiscard => auth_stat::AUTH_FAILED,
            GssError::BadToken(_) => auth_stat::AUTH_BADCRED,
            GssError::IntegrityFailure => auth_stat::AUTH_BADVERF,
            GssError::PrivacyFailure(_) => auth_stat::AUTH_BADVERF,
            GssError::Defective(_) => auth_stat::AUTH_BADCRED,
            GssError::BadKey(_) => auth_stat::AUTH_BADCRED,
            GssError::IdentityMapping(_) => auth_stat::AUTH_FAILED,
        }
    }
}
