//! Module registration — centralizes every built-in capability module.
//!
//! Adding a new module: implement `Module`, then append one entry to `BUILTIN`.

use crate::core::kernel::{Module, ModuleCatalog, OpTag};
use crate::core::partition::PartitionId;
use crate::plugins::claims::ClaimsModule;
use crate::plugins::membership::MembershipModule;
use serde::Serialize;

static MEMBERSHIP: MembershipModule = MembershipModule;
static CLAIMS: ClaimsModule = ClaimsModule;

/// All modules shipped with Charter, in registration order.
static BUILTIN: &[&'static dyn Module] = &[&MEMBERSHIP, &CLAIMS];

/// Catalog of the built-in modules.
pub fn builtin_catalog() -> ModuleCatalog {
    BUILTIN
        .iter()
        .fold(ModuleCatalog::new(), |catalog, module| catalog.with(*module))
}

#[derive(Debug, Clone, Serialize)]
pub struct ModuleDescriptor {
    pub id: String,
    pub namespace: String,
    pub partition: String,
    pub operations: Vec<OperationDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationDescriptor {
    pub name: String,
    pub tag: String,
}

/// Describe every module in `catalog` for discovery output.
pub fn describe(catalog: &ModuleCatalog) -> Vec<ModuleDescriptor> {
    catalog
        .modules()
        .iter()
        .map(|m| ModuleDescriptor {
            id: m.id().to_string(),
            namespace: m.namespace().to_string(),
            partition: PartitionId::for_namespace(m.namespace()).to_hex(),
            operations: m
                .operations()
                .iter()
                .map(|op| OperationDescriptor {
                    name: op.to_string(),
                    tag: OpTag::of(op).to_string(),
                })
                .collect(),
        })
        .collect()
}
