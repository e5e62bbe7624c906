//! RPCSEC_GSS processor (RFC 2203, RFC 5403) for the Kerberos 5 mechanism.
//!
//! The transport hands every flavor-6 call here before dispatch. Control
//! procedures (INIT / CONTINUE_INIT / DESTROY) manage context lifetime;
//! DATA calls are sequence-checked against the context's replay window and
//! their arguments unwrapped according to the per-call service level.
//!
//! Context state machine:
//!
//! ```text
//!  (no ctx) --INIT ok--> (established) --DATA--> (established)
//!         \--INIT err (reply with major=defective, no ctx)
//!  (established) --seq >= MAXSEQ--> (destroyed, ctxproblem)
//!  (established) --DESTROY--> (destroyed)
//! ```
//!
//! Two easy-to-miss requirements are honored here: the service level is read
//! from the credential on every DATA call (a context may interleave krb5 and
//! krb5i traffic), and the acceptor-subkey flag is set on every server token
//! once the client's authenticator carried a subkey.

use std::io::Cursor;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

pub mod context;
pub mod crypto;
pub mod error;
pub mod token;
pub mod verifier;
pub mod window;

use crate::protocol::xdr::gss::{
    rpc_gss_cred, rpc_gss_init_res, rpc_gss_integ_data, rpc_gss_proc, rpc_gss_service,
    split_integ_inner, GSS_S_COMPLETE, GSS_S_DEFECTIVE_CREDENTIAL, MAXSEQ,
};
use crate::protocol::xdr::rpc::opaque_auth;
use crate::protocol::xdr::{deserialize, encode};
use context::{ContextStore, GssContext};
use error::GssError;
use token::{
    FLAG_SENT_BY_ACCEPTOR, KG_USAGE_ACCEPTOR_SEAL, KG_USAGE_ACCEPTOR_SIGN,
    KG_USAGE_INITIATOR_SEAL, KG_USAGE_INITIATOR_SIGN,
};
use verifier::{Identity, IdentityMapper, Verifier};
use window::WINDOW_SIZE;

/// Default idle TTL for established contexts.
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Outcome of processing one flavor-6 call.
pub enum ProcessedCall {
    /// A control call: the init-response body to encode into the reply,
    /// plus the reply verifier.
    Control { body: rpc_gss_init_res, verf: opaque_auth },
    /// A DATA call whose arguments are now ready for dispatch.
    Data {
        /// The procedure arguments with protection removed.
        args: Vec<u8>,
        /// The established context, for wrapping the reply.
        context: Arc<GssContext>,
        /// Local identity of the authenticated principal.
        identity: Identity,
        /// Protection level taken from this call's credential.
        service: rpc_gss_service,
        /// The call's sequence number, echoed in the reply verifier.
        seq_num: u32,
    },
}

/// The RPCSEC_GSS processor: context store plus hot-swappable capabilities.
pub struct GssProcessor {
    contexts: ContextStore,
    verifier: RwLock<Arc<dyn Verifier>>,
    mapper: RwLock<Arc<dyn IdentityMapper>>,
}

impl GssProcessor {
    pub fn new(
        verifier: Arc<dyn Verifier>,
        mapper: Arc<dyn IdentityMapper>,
        context_ttl: Duration,
    ) -> GssProcessor {
        GssProcessor {
            contexts: ContextStore::new(context_ttl),
            verifier: RwLock::new(verifier),
            mapper: RwLock::new(mapper),
        }
    }

    /// Swaps the Kerberos verifier, e.g. after a keytab rotation.
    pub fn set_verifier(&self, verifier: Arc<dyn Verifier>) {
        *self.verifier.write().expect("verifier slot poisoned") = verifier;
        info!("GSS verifier replaced");
    }

    /// Swaps the principal-to-identity mapper.
    pub fn set_identity_mapper(&self, mapper: Arc<dyn IdentityMapper>) {
        *self.mapper.write().expect("mapper slot poisoned") = mapper;
        info!("GSS identity mapper replaced");
    }

    /// Number of live contexts, for diagnostics and tests.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Processes one call whose credential is RPCSEC_GSS.
    ///
    /// `call_args` are the raw procedure-argument bytes following the RPC
    /// header. For control procedures they contain the XDR-opaque GSS token;
    /// for DATA they contain the (possibly protected) procedure arguments.
    pub async fn process_call(
        &self,
        cred: &rpc_gss_cred,
        call_args: &[u8],
    ) -> Result<ProcessedCall, GssError> {
        match cred.gss_proc {
            rpc_gss_proc::RPCSEC_GSS_INIT | rpc_gss_proc::RPCSEC_GSS_CONTINUE_INIT => {
                self.establish_context(call_args).await
            }
            rpc_gss_proc::RPCSEC_GSS_DESTROY => self.destroy_context(cred),
            rpc_gss_proc::RPCSEC_GSS_DATA => self.process_data(cred, call_args).await,
        }
    }

    /// INIT / CONTINUE_INIT: verify the AP-REQ and establish a context.
    ///
    /// The context is stored before the reply is constructed so that a DATA
    /// call racing ahead of the INIT reply still finds its context. Failures
    /// produce an encoded error body rather than a dropped call.
    async fn establish_context(&self, call_args: &[u8]) -> Result<ProcessedCall, GssError> {
        let mut cursor = Cursor::new(call_args);
        let init_token = deserialize::<Vec<u8>>(&mut cursor)
            .map_err(|e| GssError::BadToken(format!("bad init token opaque: {e}")))?;

        let verification = match verifier::strip_mech_wrapper(&init_token) {
            Ok(ap_req) => {
                let verifier = self.verifier.read().expect("verifier slot poisoned").clone();
                verifier.verify_ap_req(ap_req).await
            }
            Err(e) => Err(e),
        };

        let verification = match verification {
            Ok(v) => v,
            Err(e) => {
                warn!("GSS context establishment failed: {e}");
                return Ok(ProcessedCall::Control {
                    body: rpc_gss_init_res {
                        handle: Vec::new(),
                        gss_major: GSS_S_DEFECTIVE_CREDENTIAL,
                        gss_minor: 0,
                        seq_window: 0,
                        gss_token: Vec::new(),
                    },
                    verf: opaque_auth::default(),
                });
            }
        };

        let acceptor_subkey = verification.subkey.is_some();
        let key = verification.subkey.unwrap_or(verification.session_key);
        let handle = self.contexts.fresh_handle();
        let context = Arc::new(GssContext::new(
            handle.clone(),
            verification.principal,
            verification.realm,
            key,
            acceptor_subkey,
        ));
        self.contexts.insert(context.clone());
        info!(principal = %context.principal, realm = %context.realm,
              subkey = acceptor_subkey, "GSS context established");

        let verf = self.init_reply_verifier(&context);
        Ok(ProcessedCall::Control {
            body: rpc_gss_init_res {
                handle,
                gss_major: GSS_S_COMPLETE,
                gss_minor: 0,
                seq_window: WINDOW_SIZE,
                gss_token: verification.ap_rep,
            },
            verf,
        })
    }

    /// DESTROY: drop the context. Unknown handles still succeed; the reply
    /// body uses the init-response wire shape with an empty token.
    fn destroy_context(&self, cred: &rpc_gss_cred) -> Result<ProcessedCall, GssError> {
        let removed = self.contexts.remove(&cred.handle);
        let verf = match removed {
            Some(ref context) => {
                debug!(principal = %context.principal, "GSS context destroyed");
                self.data_reply_verifier(context, cred.seq_num)
            }
            None => opaque_auth::default(),
        };
        Ok(ProcessedCall::Control {
            body: rpc_gss_init_res {
                handle: cred.handle.clone(),
                gss_major: GSS_S_COMPLETE,
                gss_minor: 0,
                seq_window: WINDOW_SIZE,
                gss_token: Vec::new(),
            },
            verf,
        })
    }

    /// DATA: replay-check the sequence number and remove argument protection.
    async fn process_data(
        &self,
        cred: &rpc_gss_cred,
        call_args: &[u8],
    ) -> Result<ProcessedCall, GssError> {
        let context = self.contexts.get(&cred.handle).ok_or(GssError::CredProblem)?;

        if cred.seq_num >= MAXSEQ {
            // RFC 2203 §5.3.3.3: the context is dead once the sequence space
            // is exhausted.
            self.contexts.remove(&cred.handle);
            return Err(GssError::CtxProblem("sequence number space exhausted".into()));
        }
        if !context.accept_seq(cred.seq_num) {
            debug!(seq = cred.seq_num, "discarding replayed or below-window DATA call");
            return Err(GssError::SilentDiscard);
        }

        // The service is taken from this call's credential; contexts do not
        // pin a protection level at establishment.
        let args = match cred.service {
            rpc_gss_service::RPC_GSS_SVC_NONE => call_args.to_vec(),
            rpc_gss_service::RPC_GSS_SVC_INTEGRITY => {
                let mut cursor = Cursor::new(call_args);
                let integ = deserialize::<rpc_gss_integ_data>(&mut cursor)
                    .map_err(|e| GssError::BadToken(format!("bad integ body: {e}")))?;
                let info = token::verify_mic(
                    &context.key,
                    KG_USAGE_INITIATOR_SIGN,
                    &integ.checksum,
                    &integ.databody,
                )?;
                if info.flags & FLAG_SENT_BY_ACCEPTOR != 0 {
                    return Err(GssError::BadToken("client MIC claims acceptor origin".into()));
                }
                let (seq_copy, args) = split_integ_inner(&integ.databody)
                    .map_err(|e| GssError::BadToken(e.to_string()))?;
                if seq_copy != cred.seq_num {
                    return Err(GssError::CtxProblem(format!(
                        "integrity seq {seq_copy} does not match credential {}",
                        cred.seq_num
                    )));
                }
                args
            }
            rpc_gss_service::RPC_GSS_SVC_PRIVACY => {
                let mut cursor = Cursor::new(call_args);
                let wrap_token = deserialize::<Vec<u8>>(&mut cursor)
                    .map_err(|e| GssError::BadToken(format!("bad priv body: {e}")))?;
                let unwrapped =
                    token::unwrap(&context.key, KG_USAGE_INITIATOR_SEAL, &wrap_token)?;
                if unwrapped.info.flags & FLAG_SENT_BY_ACCEPTOR != 0 {
                    return Err(GssError::BadToken("client Wrap claims acceptor origin".into()));
                }
                let (seq_copy, args) = split_integ_inner(&unwrapped.data)
                    .map_err(|e| GssError::BadToken(e.to_string()))?;
                if seq_copy != cred.seq_num {
                    return Err(GssError::CtxProblem(format!(
                        "privacy seq {seq_copy} does not match credential {}",
                        cred.seq_num
                    )));
                }
                args
            }
        };

        let mapper = self.mapper.read().expect("mapper slot poisoned").clone();
        let identity = mapper.map(&context.principal, &context.realm).await?;

        Ok(ProcessedCall::Data {
            args,
            context,
            identity,
            service: cred.service,
            seq_num: cred.seq_num,
        })
    }

    /// Applies the reply-side protection matching the call's service level.
    ///
    /// Returns the procedure-result bytes to place after the reply header.
    pub fn wrap_reply(
        &self,
        context: &GssContext,
        service: rpc_gss_service,
        seq_num: u32,
        reply: &[u8],
    ) -> Result<Vec<u8>, GssError> {
        match service {
            rpc_gss_service::RPC_GSS_SVC_NONE => Ok(reply.to_vec()),
            rpc_gss_service::RPC_GSS_SVC_INTEGRITY => {
                let databody = crate::protocol::xdr::gss::integ_inner(seq_num, reply);
                let checksum = token::get_mic(
                    &context.key,
                    KG_USAGE_ACCEPTOR_SIGN,
                    context.acceptor_flags(),
                    seq_num as u64,
                    &databody,
                );
                encode(&rpc_gss_integ_data { databody, checksum })
                    .map_err(|e| GssError::BadToken(e.to_string()))
            }
            rpc_gss_service::RPC_GSS_SVC_PRIVACY => {
                let inner = crate::protocol::xdr::gss::integ_inner(seq_num, reply);
                let wrapped = token::wrap(
                    &context.key,
                    KG_USAGE_ACCEPTOR_SEAL,
                    context.acceptor_flags(),
                    seq_num as u64,
                    &inner,
                    true,
                );
                encode(&wrapped).map_err(|e| GssError::BadToken(e.to_string()))
            }
        }
    }

    /// Reply verifier for a DATA reply: MIC of the call's sequence number.
    pub fn data_reply_verifier(&self, context: &GssContext, seq_num: u32) -> opaque_auth {
        let seq_bytes = seq_num.to_be_bytes();
        let mic = token::get_mic(
            &context.key,
            KG_USAGE_ACCEPTOR_SIGN,
            context.acceptor_flags(),
            seq_num as u64,
            &seq_bytes,
        );
        opaque_auth::gss_mic(mic)
    }

    /// Reply verifier for a successful INIT: MIC of the sequence window.
    fn init_reply_verifier(&self, context: &GssContext) -> opaque_auth {
        let window_bytes = WINDOW_SIZE.to_be_bytes();
        let mic = token::get_mic(
            &context.key,
            KG_USAGE_ACCEPTOR_SIGN,
            context.acceptor_flags(),
            0,
            &window_bytes,
        );
        opaque_auth::gss_mic(mic)
    }
}
