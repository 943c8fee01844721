//! Membership module: role store and join-request workflow.
//!
//! Other modules treat `get_role` as the instance's access-control oracle.

use crate::core::address::Address;
use crate::core::error::{CharterError, Reason};
use crate::core::kernel::{ExecContext, Module, decode_payload};
use crate::core::partition::Partition;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const MODULE_ID: &str = "membership";
pub const NAMESPACE: &str = "charter.modules.membership.v1";

pub const OP_REQUEST_TO_JOIN: &str = "request_to_join";
pub const OP_ACCEPT_REQUEST: &str = "accept_request";
pub const OP_REJECT_REQUEST: &str = "reject_request";
pub const OP_REMOVE_MEMBER: &str = "remove_member";
pub const OP_CHANGE_ROLE: &str = "change_role";
pub const OP_GET_ROLE: &str = "get_role";
pub const OP_GET_MEMBERS: &str = "get_members";
pub const OP_GET_JOIN_REQUESTS: &str = "get_join_requests";
pub const OP_GET_MEMBER_COUNT: &str = "get_member_count";
pub const OP_HAS_PENDING_REQUEST: &str = "has_pending_request";

static OPERATIONS: &[&str] = &[
    OP_REQUEST_TO_JOIN,
    OP_ACCEPT_REQUEST,
    OP_REJECT_REQUEST,
    OP_REMOVE_MEMBER,
    OP_CHANGE_ROLE,
    OP_GET_ROLE,
    OP_GET_MEMBERS,
    OP_GET_JOIN_REQUESTS,
    OP_GET_MEMBER_COUNT,
    OP_HAS_PENDING_REQUEST,
];

// Partition layout
const KEY_INITIALIZED: &str = "initialized";
const KEY_MEMBERS: &str = "members";
const KEY_REQUEST_QUEUE: &str = "request_queue";
const ROLE_PREFIX: &str = "role/";
const REQUEST_PREFIX: &str = "request/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    None,
    Member,
    Admin,
}

impl Role {
    /// Parse a role from a payload value: a name (any case) or its ordinal.
    pub fn from_value(value: &Value) -> Result<Role, CharterError> {
        let parsed = match value {
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "none" => Some(Role::None),
                "member" => Some(Role::Member),
                "admin" => Some(Role::Admin),
                _ => None,
            },
            Value::Number(n) => match n.as_u64() {
                Some(0) => Some(Role::None),
                Some(1) => Some(Role::Member),
                Some(2) => Some(Role::Admin),
                _ => None,
            },
            _ => None,
        };
        parsed.ok_or(CharterError::ValidationError(Reason::InvalidRole))
    }

    /// Roles that may be granted: Member or Admin.
    pub fn assignable(value: &Value) -> Result<Role, CharterError> {
        match Role::from_value(value)? {
            Role::None => Err(CharterError::ValidationError(Reason::InvalidRole)),
            role => Ok(role),
        }
    }

    pub fn is_member(self) -> bool {
        matches!(self, Role::Member | Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub address: Address,
    pub pending: bool,
    pub requested_at: u64,
}

#[derive(Deserialize)]
struct InitArgs {
    admin: Address,
}

#[derive(Deserialize)]
struct AddressArgs {
    address: Address,
}

#[derive(Deserialize)]
struct RequesterArgs {
    requester: Address,
}

#[derive(Deserialize)]
struct RoleGrantArgs {
    requester: Address,
    role: Value,
}

#[derive(Deserialize)]
struct MemberArgs {
    member: Address,
}

#[derive(Deserialize)]
struct RoleChangeArgs {
    member: Address,
    role: Value,
}

/// Typed view over the membership partition.
struct Roster<'p, 'a> {
    part: &'p Partition<'a>,
}

impl Roster<'_, '_> {
    fn role(&self, address: &Address) -> Result<Role, CharterError> {
        self.part.get_or_default(&format!("{}{}", ROLE_PREFIX, address))
    }

    fn set_role(&self, address: &Address, role: Role) -> Result<(), CharterError> {
        let key = format!("{}{}", ROLE_PREFIX, address);
        if role == Role::None {
            self.part.remove(&key)?;
            Ok(())
        } else {
            self.part.set(&key, &role)
        }
    }

    fn members(&self) -> Result<Vec<Address>, CharterError> {
        self.part.get_or_default(KEY_MEMBERS)
    }

    fn append_member(&self, address: &Address) -> Result<(), CharterError> {
        let mut members = self.members()?;
        members.push(address.clone());
        self.part.set(KEY_MEMBERS, &members)
    }

    /// Swap-remove the first listing entry for `address`.
    fn delist_member(&self, address: &Address) -> Result<(), CharterError> {
        let mut members = self.members()?;
        if let Some(pos) = members.iter().position(|m| m == address) {
            members.swap_remove(pos);
            self.part.set(KEY_MEMBERS, &members)?;
        }
        Ok(())
    }

    fn request(&self, address: &Address) -> Result<Option<JoinRequest>, CharterError> {
        self.part.get(&format!("{}{}", REQUEST_PREFIX, address))
    }

    fn has_pending_request(&self, address: &Address) -> Result<bool, CharterError> {
        Ok(self.request(address)?.is_some_and(|r| r.pending))
    }

    fn open_request(&self, address: &Address, at: u64) -> Result<(), CharterError> {
        let request = JoinRequest {
            address: address.clone(),
            pending: true,
            requested_at: at,
        };
        self.part.set(&format!("{}{}", REQUEST_PREFIX, address), &request)?;
        let mut queue = self.request_queue()?;
        queue.push(address.clone());
        self.part.set(KEY_REQUEST_QUEUE, &queue)
    }

    fn clear_request(&self, address: &Address) -> Result<(), CharterError> {
        self.part.remove(&format!("{}{}", REQUEST_PREFIX, address))?;
        let mut queue = self.request_queue()?;
        queue.retain(|a| a != address);
        self.part.set(KEY_REQUEST_QUEUE, &queue)
    }

    fn request_queue(&self) -> Result<Vec<Address>, CharterError> {
        self.part.get_or_default(KEY_REQUEST_QUEUE)
    }

    fn require_admin(&self, caller: &Address) -> Result<(), CharterError> {
        if self.role(caller)? != Role::Admin {
            return Err(CharterError::AuthorizationError(Reason::OnlyAdmin));
        }
        Ok(())
    }

    fn require_pending(&self, address: &Address) -> Result<(), CharterError> {
        if !self.has_pending_request(address)? {
            return Err(CharterError::NotFound(Reason::NoRequest));
        }
        Ok(())
    }

    fn require_role_holder(&self, address: &Address) -> Result<Role, CharterError> {
        let role = self.role(address)?;
        if role == Role::None {
            return Err(CharterError::StateError(Reason::NotMember));
        }
        Ok(role)
    }
}

pub struct MembershipModule;

impl Module for MembershipModule {
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
        {
            let part = ctx.storage();
            if part.get_or_default::<bool>(KEY_INITIALIZED)? {
                return Err(CharterError::StateError(Reason::AlreadyInitialized));
            }
            let roster = Roster { part };
            roster.set_role(&args.admin, Role::Admin)?;
            roster.append_member(&args.admin)?;
            part.set(KEY_INITIALIZED, &true)?;
        }
        ctx.emit("member_added", json!({ "address": args.admin, "role": Role::Admin }));
        Ok(())
    }

    fn call(
        &self,
        ctx: &mut ExecContext<'_>,
        operation: &str,
        payload: &Value,
    ) -> Result<Value, CharterError> {
        let caller = ctx.caller().clone();
        match operation {
            OP_REQUEST_TO_JOIN => {
                let at = ctx.timestamp();
                {
                    let roster = Roster { part: ctx.storage() };
                    if roster.role(&caller)? != Role::None {
                        return Err(CharterError::StateError(Reason::AlreadyMember));
                    }
                    if roster.has_pending_request(&caller)? {
                        return Err(CharterError::StateError(Reason::AlreadyRequested));
                    }
                    roster.open_request(&caller, at)?;
                }
                ctx.emit("join_requested", json!({ "address": caller }));
                Ok(Value::Null)
            }
            OP_ACCEPT_REQUEST => {
                let args: RoleGrantArgs = decode_payload(payload)?;
                let role = {
                    let roster = Roster { part: ctx.storage() };
                    roster.require_admin(&caller)?;
                    roster.require_pending(&args.requester)?;
                    let role = Role::assignable(&args.role)?;
                    roster.clear_request(&args.requester)?;
                    roster.set_role(&args.requester, role)?;
                    roster.append_member(&args.requester)?;
                    role
                };
                ctx.emit(
                    "join_request_accepted",
                    json!({ "address": args.requester, "role": role, "by": caller }),
                );
                Ok(Value::Null)
            }
            OP_REJECT_REQUEST => {
                let args: RequesterArgs = decode_payload(payload)?;
                {
                    let roster = Roster { part: ctx.storage() };
                    roster.require_admin(&caller)?;
                    roster.require_pending(&args.requester)?;
                    roster.clear_request(&args.requester)?;
                }
                ctx.emit(
                    "join_request_rejected",
                    json!({ "address": args.requester, "by": caller }),
                );
                Ok(Value::Null)
            }
            OP_REMOVE_MEMBER => {
                let args: MemberArgs = decode_payload(payload)?;
                {
                    let roster = Roster { part: ctx.storage() };
                    roster.require_admin(&caller)?;
                    roster.require_role_holder(&args.member)?;
                    roster.set_role(&args.member, Role::None)?;
                    roster.delist_member(&args.member)?;
                }
                ctx.emit("member_removed", json!({ "address": args.member, "by": caller }));
                Ok(Value::Null)
            }
            OP_CHANGE_ROLE => {
                let args: RoleChangeArgs = decode_payload(payload)?;
                let (from, to) = {
                    let roster = Roster { part: ctx.storage() };
                    roster.require_admin(&caller)?;
                    let from = roster.require_role_holder(&args.member)?;
                    let to = Role::assignable(&args.role)?;
                    roster.set_role(&args.member, to)?;
                    (from, to)
                };
                ctx.emit(
                    "role_changed",
                    json!({ "address": args.member, "from": from, "to": to, "by": caller }),
                );
                Ok(Value::Null)
            }
            OP_GET_ROLE => {
                let args: AddressArgs = decode_payload(payload)?;
                let role = Roster { part: ctx.storage() }.role(&args.address)?;
                Ok(json!(role))
            }
            OP_GET_MEMBERS => Ok(json!(Roster { part: ctx.storage() }.members()?)),
            OP_GET_JOIN_REQUESTS => {
                let roster = Roster { part: ctx.storage() };
                let mut pending = Vec::new();
                for address in roster.request_queue()? {
                    if roster.has_pending_request(&address)? {
                        pending.push(address);
                    }
                }
                Ok(json!(pending))
            }
            OP_GET_MEMBER_COUNT => {
                let count = Roster { part: ctx.storage() }.members()?.len();
                Ok(json!(count as u64))
            }
            OP_HAS_PENDING_REQUEST => {
                let args: AddressArgs = decode_payload(payload)?;
                let pending = Roster { part: ctx.storage() }.has_pending_request(&args.address)?;
                Ok(json!(pending))
            }
            other => Err(CharterError::NotFound(Reason::UnknownOperation(other.to_string()))),
        }
    }
}
