//! The emulated coprocessor fabric.

use alloc::vec::Vec;

use crate::crb::ControlWord;
use crate::dispatch::Outcome;
use crate::{CapabilityMask, CoprocessorType, VirtualAddress};

/// A request accepted by an emulated instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedRequest {
    pub instance: usize,
    pub control_word: ControlWord,
    pub crb: VirtualAddress,
}

struct Instance {
    coprocessor_type: CoprocessorType,
    busy: bool,
}

struct FabricState {
    instances: Vec<Instance>,
    started: Vec<StartedRequest>,
    outcomes: Vec<Outcome>,
}

/// Coprocessor instances reachable from every emulated CPU.
///
/// An instance takes one request at a time and stays busy until
/// [`EmulatedFabric::complete`] is called for it.
pub struct EmulatedFabric {
    state: spin::Mutex<FabricState>,
}

impl EmulatedFabric {
    pub(super) fn new() -> Self {
        Self {
            state: spin::Mutex::new(FabricState {
                instances: Vec::new(),
                started: Vec::new(),
                outcomes: Vec::new(),
            }),
        }
    }

    /// Adds an idle instance of `ty` and returns its index.
    pub fn add_instance(&self, ty: CoprocessorType) -> usize {
        let mut state = self.state.lock();
        state.instances.push(Instance {
            coprocessor_type: ty,
            busy: false,
        });
        state.instances.len() - 1
    }

    /// Marks every instance of `ty` busy.
    pub fn occupy(&self, ty: CoprocessorType) {
        let mut state = self.state.lock();
        for instance in state
            .instances
            .iter_mut()
            .filter(|i| i.coprocessor_type == ty)
        {
            instance.busy = true;
        }
    }

    /// Finishes the request running on `instance`, making it idle again.
    pub fn complete(&self, instance: usize) {
        if let Some(instance) = self.state.lock().instances.get_mut(instance) {
            instance.busy = false;
        }
    }

    /// Returns every request accepted so far, in order.
    pub fn started(&self) -> Vec<StartedRequest> {
        self.state.lock().started.clone()
    }

    /// Returns the outcome of every dispatch so far, in order.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.state.lock().outcomes.clone()
    }

    /// Dispatches with the issuing CPU's loaded capability register.
    pub(super) fn dispatch(
        &self,
        control_word: ControlWord,
        crb: VirtualAddress,
        loaded: CapabilityMask,
    ) -> Outcome {
        let ty = control_word.coprocessor_type();
        let mut state = self.state.lock();

        let outcome = if !loaded.contains(ty) {
            Outcome::NotFound
        } else {
            let mut present = false;
            let mut idle = None;
            for (index, instance) in state.instances.iter().enumerate() {
                if instance.coprocessor_type == ty {
                    present = true;
                    if !instance.busy {
                        idle = Some(index);
                        break;
                    }
                }
            }

            match idle {
                Some(instance) => {
                    state.instances[instance].busy = true;
                    state.started.push(StartedRequest {
                        instance,
                        control_word,
                        crb,
                    });
                    Outcome::Started
                }
                None if present => Outcome::Busy,
                None => Outcome::NotFound,
            }
        };

        state.outcomes.push(outcome);
        outcome
    }
}
