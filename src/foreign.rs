// This module implements the foreign-call registry: descriptors declaring what a
// call into externally-compiled code means semantically, linkages realizing a
// descriptor against a concrete register configuration, and the memoizing resolver
// shared read-only between concurrent compilations. A descriptor records the
// invariants lowering depends on: whether the call may be re-executed after a
// rolled-back prefix, whether it can transfer control outside the normal return
// path, whether it is guaranteed to contain a checkpoint, and which memory
// locations it invalidates. The linkage adds the target facts: argument and result
// registers, the clobber set, and whether every register is destroyed.

//! Foreign call descriptors, linkages, and the memoizing registry.

use crate::error::{BackendError, CompileResult};
use crate::lir::{PhysReg, ValueKind};
use crate::regalloc::config::{RegMask, RegisterAllocationConfig};
use hashbrown::HashMap;
use std::sync::{Arc, RwLock};

/// Memory invalidated by a foreign call.
///
/// Consumed during lowering to decide whether memory values materialized
/// before the call may be reused after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KilledLocations {
    /// The call may write anywhere.
    All,
    /// The call writes only the named locations. An empty list means the
    /// call leaves memory alone.
    Named(Vec<&'static str>),
}

impl KilledLocations {
    pub fn none() -> Self {
        KilledLocations::Named(Vec::new())
    }

    /// True if a load of unknown provenance must be re-materialized after
    /// the call.
    pub fn invalidates_unknown_loads(&self) -> bool {
        match self {
            KilledLocations::All => true,
            KilledLocations::Named(names) => !names.is_empty(),
        }
    }
}

/// Target-independent description of a foreign call. Identity-compared:
/// the registry hands out one `Arc` per registered name and resolution is
/// keyed on it.
#[derive(Debug)]
pub struct ForeignCallDescriptor {
    pub name: &'static str,
    pub result: Option<ValueKind>,
    pub args: Vec<ValueKind>,
    /// No side effect blocks re-execution after a rollback.
    pub reexecutable: bool,
    /// The call may transfer control outside the normal return path.
    pub can_interrupt: bool,
    /// The call is guaranteed to contain a safepoint-equivalent checkpoint.
    pub guaranteed_checkpoint: bool,
    pub killed: KilledLocations,
}

impl ForeignCallDescriptor {
    /// Whether call sites need resume/unwind state attached.
    pub fn needs_state(&self) -> bool {
        self.can_interrupt || self.guaranteed_checkpoint
    }
}

/// Register effect of the foreign code behind a descriptor, declared at
/// registration time because only the embedder knows how the callee was
/// compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEffect {
    /// Conforming callee: destroys exactly the caller-saved set.
    Conforming,
    /// Destroys every register, callee-saved included.
    DestroysAll,
}

/// Where one argument travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgLoc {
    pub reg: PhysReg,
    pub kind: ValueKind,
}

/// A descriptor resolved against one register configuration.
#[derive(Debug)]
pub struct ForeignCallLinkage {
    pub descriptor: Arc<ForeignCallDescriptor>,
    /// Outgoing argument registers, one per descriptor argument.
    pub arg_locs: Vec<ArgLoc>,
    pub ret_loc: Option<PhysReg>,
    /// Registers destroyed by the call.
    pub clobbers: RegMask,
    pub destroys_all_registers: bool,
    /// Call sites must carry debug/checkpoint state.
    pub needs_state: bool,
    /// The caller must re-establish its reserved registers after the call
    /// returns (set for non-conforming callees).
    pub needs_reg_cleanup: bool,
}

struct Registered {
    descriptor: Arc<ForeignCallDescriptor>,
    effect: CallEffect,
}

/// Registry mapping call names to descriptors and memoizing linkage
/// resolution. Shared read-only across concurrent compilations; concurrent
/// first resolution of one descriptor may compute the linkage twice, which
/// is harmless because both computations produce the same value.
#[derive(Default)]
pub struct ForeignCallRegistry {
    descriptors: RwLock<HashMap<&'static str, Registered>>,
    linkages: RwLock<HashMap<&'static str, Arc<ForeignCallLinkage>>>,
}

impl ForeignCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor together with its register effect. Returns the
    /// shared descriptor handle used for identity comparison.
    pub fn register(
        &self,
        descriptor: ForeignCallDescriptor,
        effect: CallEffect,
    ) -> CompileResult<Arc<ForeignCallDescriptor>> {
        let mut map = self
            .descriptors
            .write()
            .map_err(|_| BackendError::internal("foreign", "descriptor table poisoned"))?;
        if map.contains_key(descriptor.name) {
            return Err(BackendError::internal(
                "foreign",
                format!("descriptor '{}' registered twice", descriptor.name),
            ));
        }
        let arc = Arc::new(descriptor);
        map.insert(
            arc.name,
            Registered {
                descriptor: Arc::clone(&arc),
                effect,
            },
        );
        Ok(arc)
    }

    /// Look up a registered descriptor by name.
    pub fn find(&self, name: &str) -> Option<Arc<ForeignCallDescriptor>> {
        self.descriptors
            .read()
            .ok()?
            .get(name)
            .map(|r| Arc::clone(&r.descriptor))
    }

    /// Resolve a descriptor to its linkage for the given configuration,
    /// memoized by descriptor identity.
    pub fn resolve(
        &self,
        descriptor: &Arc<ForeignCallDescriptor>,
        config: &RegisterAllocationConfig,
    ) -> CompileResult<Arc<ForeignCallLinkage>> {
        if let Ok(cache) = self.linkages.read() {
            if let Some(linkage) = cache.get(descriptor.name) {
                return Ok(Arc::clone(linkage));
            }
        }

        let effect = {
            let map = self
                .descriptors
                .read()
                .map_err(|_| BackendError::internal("foreign", "descriptor table poisoned"))?;
            let registered = map.get(descriptor.name).ok_or_else(|| {
                BackendError::internal(
                    "foreign",
                    format!("descriptor '{}' was never registered", descriptor.name),
                )
            })?;
            if !Arc::ptr_eq(&registered.descriptor, descriptor) {
                return Err(BackendError::internal(
                    "foreign",
                    format!("descriptor '{}' identity mismatch", descriptor.name),
                ));
            }
            registered.effect
        };

        let linkage = Arc::new(Self::compute_linkage(descriptor, effect, config)?);

        let mut cache = self
            .linkages
            .write()
            .map_err(|_| BackendError::internal("foreign", "linkage cache poisoned"))?;
        // A racing resolver may have inserted the same linkage already; keep
        // the first one so identity stays stable for callers that raced.
        let entry = cache
            .entry(descriptor.name)
            .or_insert_with(|| Arc::clone(&linkage));
        Ok(Arc::clone(entry))
    }

    fn compute_linkage(
        descriptor: &Arc<ForeignCallDescriptor>,
        effect: CallEffect,
        config: &RegisterAllocationConfig,
    ) -> CompileResult<ForeignCallLinkage> {
        let mut counts = [0usize; 2];
        let mut arg_locs = Vec::with_capacity(descriptor.args.len());
        for (i, &kind) in descriptor.args.iter().enumerate() {
            let class_idx = config.bank_for(kind.class) as usize;
            let reg = config
                .call_conv
                .arg_reg(kind.class, counts[class_idx])
                .ok_or_else(|| {
                    BackendError::internal(
                        "foreign",
                        format!(
                            "argument {i} of '{}' exceeds the register argument capacity",
                            descriptor.name
                        ),
                    )
                })?;
            counts[class_idx] += 1;
            arg_locs.push(ArgLoc { reg, kind });
        }

        let ret_loc = descriptor
            .result
            .map(|kind| config.call_conv.ret_reg(kind.class));

        let destroys_all = effect == CallEffect::DestroysAll;
        let clobbers = if destroys_all {
            config.allocatable.union(config.callee_saved)
        } else {
            config.call_conv.caller_saved
        };

        Ok(ForeignCallLinkage {
            descriptor: Arc::clone(descriptor),
            arg_locs,
            ret_loc,
            clobbers,
            destroys_all_registers: destroys_all,
            needs_state: descriptor.needs_state(),
            needs_reg_cleanup: destroys_all,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64;

    fn descriptor(name: &'static str) -> ForeignCallDescriptor {
        ForeignCallDescriptor {
            name,
            result: Some(ValueKind::word()),
            args: vec![ValueKind::word(), ValueKind::word()],
            reexecutable: true,
            can_interrupt: false,
            guaranteed_checkpoint: false,
            killed: KilledLocations::none(),
        }
    }

    #[test]
    fn resolution_is_memoized_by_identity() {
        let registry = ForeignCallRegistry::new();
        let config = x64::config();
        let desc = registry
            .register(descriptor("unit_test_helper"), CallEffect::Conforming)
            .unwrap();

        let first = registry.resolve(&desc, &config).unwrap();
        let second = registry.resolve(&desc, &config).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn conforming_linkage_clobbers_caller_saved_only() {
        let registry = ForeignCallRegistry::new();
        let config = x64::config();
        let desc = registry
            .register(descriptor("conforming_helper"), CallEffect::Conforming)
            .unwrap();

        let linkage = registry.resolve(&desc, &config).unwrap();
        assert!(!linkage.destroys_all_registers);
        assert_eq!(linkage.clobbers, config.call_conv.caller_saved);
        assert_eq!(linkage.arg_locs.len(), 2);
        assert!(linkage.ret_loc.is_some());
    }

    #[test]
    fn destroys_all_linkage_covers_callee_saved() {
        let registry = ForeignCallRegistry::new();
        let config = x64::config();
        let desc = registry
            .register(descriptor("trampoline_helper"), CallEffect::DestroysAll)
            .unwrap();

        let linkage = registry.resolve(&desc, &config).unwrap();
        assert!(linkage.destroys_all_registers);
        assert!(linkage.needs_reg_cleanup);
        for reg in config.callee_saved.iter_bank(0) {
            assert!(linkage.clobbers.contains(reg));
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ForeignCallRegistry::new();
        registry
            .register(descriptor("dup"), CallEffect::Conforming)
            .unwrap();
        assert!(registry
            .register(descriptor("dup"), CallEffect::Conforming)
            .is_err());
    }

    #[test]
    fn checkpoint_descriptors_demand_state() {
        let mut desc = descriptor("with_state");
        desc.guaranteed_checkpoint = true;
        assert!(desc.needs_state());

        let mut desc2 = descriptor("interrupting");
        desc2.can_interrupt = true;
        assert!(desc2.needs_state());
    }
}
