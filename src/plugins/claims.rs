//! Claims module: proposal store with quorum-based finalization.
//!
//! Access control is resolved by asking the instance for the caller's role
//! through the kernel's in-process query path; this module never reads the
//! membership partition itself.

use crate::core::address::Address;
use crate::core::error::{CharterError, Reason};
use crate::core::kernel::{ExecContext, Module, decode_payload};
use crate::core::partition::Partition;
use crate::plugins::membership::{OP_GET_ROLE, Role};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value, json};
use std::collections::BTreeSet;

pub const MODULE_ID: &str = "claims";
pub const NAMESPACE: &str = "charter.modules.claims.v1";

pub const OP_CREATE_CLAIM: &str = "create_claim";
pub const OP_VOTE_ON_CLAIM: &str = "vote_on_claim";
pub const OP_GET_CLAIM: &str = "get_claim";
pub const OP_GET_CLAIMS: &str = "get_claims";
pub const OP_GET_QUORUM: &str = "get_quorum";
pub const OP_GET_CLAIM_COUNT: &str = "get_claim_count";
pub const OP_HAS_VOTED: &str = "has_voted";

static OPERATIONS: &[&str] = &[
    OP_CREATE_CLAIM,
    OP_VOTE_ON_CLAIM,
    OP_GET_CLAIM,
    OP_GET_CLAIMS,
    OP_GET_QUORUM,
    OP_GET_CLAIM_COUNT,
    OP_HAS_VOTED,
];

const KEY_INITIALIZED: &str = "initialized";
const KEY_QUORUM: &str = "quorum";
const KEY_NEXT_CLAIM_ID: &str = "next_claim_id";

fn claim_key(id: u64) -> String {
    format!("claim/{:020}", id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: u64,
    pub claimant: Address,
    pub title: String,
    pub amount: u64,
    pub description: String,
    pub approvals: u64,
    pub rejections: u64,
    pub created_at: u64,
    pub status: ClaimStatus,
    pub voters: BTreeSet<Address>,
}

impl Claim {
    /// Count one vote and finalize if a side has reached `quorum`.
    ///
    /// Approval is checked before rejection. Returns true when this vote
    /// moved the claim out of `Pending`.
    pub fn record_vote(&mut self, voter: Address, approve: bool, quorum: u64) -> bool {
        self.voters.insert(voter);
        if approve {
            self.approvals += 1;
        } else {
            self.rejections += 1;
        }
        if self.approvals >= quorum {
            self.status = ClaimStatus::Approved;
        } else if self.rejections >= quorum {
            self.status = ClaimStatus::Rejected;
        }
        self.status != ClaimStatus::Pending
    }
}

#[derive(Deserialize)]
struct InitArgs {
    quorum: Number,
}

#[derive(Deserialize)]
struct CreateArgs {
    title: String,
    amount: u64,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct VoteArgs {
    claim_id: u64,
    approve: bool,
}

#[derive(Deserialize)]
struct ClaimIdArgs {
    claim_id: u64,
}

#[derive(Deserialize)]
struct HasVotedArgs {
    claim_id: u64,
    address: Address,
}

fn load_claim(part: &Partition<'_>, id: u64) -> Result<Claim, CharterError> {
    part.get(&claim_key(id))?
        .ok_or(CharterError::NotFound(Reason::UnknownClaim(id)))
}

/// Ask the instance which role the current caller holds.
fn caller_role(ctx: &mut ExecContext<'_>) -> Result<Role, CharterError> {
    let caller = ctx.caller().clone();
    let answer = ctx.query(OP_GET_ROLE, json!({ "address": caller }))?;
    Role::from_value(&answer)
}

fn require_member(ctx: &mut ExecContext<'_>) -> Result<(), CharterError> {
    if !caller_role(ctx)?.is_member() {
        return Err(CharterError::AuthorizationError(Reason::OnlyMember));
    }
    Ok(())
}

pub struct ClaimsModule;

impl Module for ClaimsModule {
    fn id(&self) -> &'static str {
        MODULE_ID
    }

    fn namespace(&self) -> &'static str {
        NAMESPACE
    }

    fn operations(&self) -> &'static [&'static str] {
        OPERATIONS
    }

    fn init(&self, ctx: &mut ExecContext<'_>, payload: &Value) -> Result<(), CharterError> {
        let args: InitArgs = decode_payload(payload)?;
        let part = ctx.storage();
        if part.get_or_default::<bool>(KEY_INITIALIZED)? {
            return Err(CharterError::StateError(Reason::AlreadyInitialized));
        }
        let quorum = match args.quorum.as_u64() {
            Some(q) if q > 0 => q,
            _ => return Err(CharterError::ValidationError(Reason::InvalidQuorum)),
        };
        part.set(KEY_QUORUM, &quorum)?;
        part.set(KEY_NEXT_CLAIM_ID, &0u64)?;
        part.set(KEY_INITIALIZED, &true)?;
        Ok(())
    }

    fn call(
        &self,
        ctx: &mut ExecContext<'_>,
        operation: &str,
        payload: &Value,
    ) -> Result<Value, CharterError> {
        match operation {
            OP_CREATE_CLAIM => {
                let args: CreateArgs = decode_payload(payload)?;
                require_member(ctx)?;
                let claim = {
                    let part = ctx.storage();
                    let id: u64 = part.get_or_default(KEY_NEXT_CLAIM_ID)?;
                    let claim = Claim {
                        id,
                        claimant: ctx.caller().clone(),
                        title: args.title,
                        amount: args.amount,
                        description: args.description,
                        approvals: 0,
                        rejections: 0,
                        created_at: ctx.timestamp(),
                        status: ClaimStatus::Pending,
                        voters: BTreeSet::new(),
                    };
                    part.set(&claim_key(id), &claim)?;
                    part.set(KEY_NEXT_CLAIM_ID, &(id + 1))?;
                    claim
                };
                ctx.emit(
                    "claim_created",
                    json!({ "claim_id": claim.id, "claimant": claim.claimant, "amount": claim.amount }),
                );
                Ok(json!(claim))
            }
            OP_VOTE_ON_CLAIM => {
                let args: VoteArgs = decode_payload(payload)?;
                require_member(ctx)?;
                let voter = ctx.caller().clone();
                let (claim, finalized) = {
                    let part = ctx.storage();
                    let mut claim = load_claim(part, args.claim_id)?;
                    if claim.status != ClaimStatus::Pending {
                        return Err(CharterError::StateError(Reason::NotPending));
                    }
                    if claim.claimant == voter {
                        return Err(CharterError::AuthorizationError(Reason::ClaimantCannotVote));
                    }
                    if claim.voters.contains(&voter) {
                        return Err(CharterError::StateError(Reason::AlreadyVoted));
                    }
                    let quorum: u64 = part.get_or_default(KEY_QUORUM)?;
                    let finalized = claim.record_vote(voter.clone(), args.approve, quorum);
                    part.set(&claim_key(claim.id), &claim)?;
                    (claim, finalized)
                };
                ctx.emit(
                    "vote_cast",
                    json!({ "claim_id": claim.id, "voter": voter, "approve": args.approve }),
                );
                if finalized {
                    ctx.emit(
                        "claim_finalized",
                        json!({ "claim_id": claim.id, "status": claim.status }),
                    );
                }
                Ok(json!(claim))
            }
            OP_GET_CLAIM => {
                let args: ClaimIdArgs = decode_payload(payload)?;
                Ok(json!(load_claim(ctx.storage(), args.claim_id)?))
            }
            OP_GET_CLAIMS => {
                let part = ctx.storage();
                let mut claims = Vec::new();
                for key in part.keys_with_prefix("claim/")? {
                    if let Some(claim) = part.get::<Claim>(&key)? {
                        claims.push(claim);
                    }
                }
                Ok(json!(claims))
            }
            OP_GET_QUORUM => Ok(json!(ctx.storage().get_or_default::<u64>(KEY_QUORUM)?)),
            OP_GET_CLAIM_COUNT => Ok(json!(
                ctx.storage().get_or_default::<u64>(KEY_NEXT_CLAIM_ID)?
            )),
            OP_HAS_VOTED => {
                let args: HasVotedArgs = decode_payload(payload)?;
                let claim = load_claim(ctx.storage(), args.claim_id)?;
                Ok(json!(claim.voters.contains(&args.address)))
            }
            other => Err(CharterError::NotFound(Reason::UnknownOperation(other.to_string()))),
        }
    }
}
