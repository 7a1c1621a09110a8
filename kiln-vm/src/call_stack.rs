use kiln_types::primitives::{Address, ZERO_ADDRESS};

use crate::error::VmError;
use crate::gas::MAX_CALL_DEPTH;

/// A single frame on the cross-contract call stack.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    /// The contract executing in this frame.
    pub contract: Address,
}

/// Tracks the nested call chain of one invocation.
///
/// Entries and exits are paired by the instrumentation wrappers around
/// exported functions. Exits verify the frame they pop, so a contract that
/// manipulates its own context tracking is caught instead of silently
/// corrupting the chain. Re-entrancy is permitted; depth bounds recursion.
#[derive(Debug, Clone)]
pub struct CallStack {
    frames: Vec<CallFrame>,
    max_depth: u8,
}

impl CallStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            max_depth: MAX_CALL_DEPTH,
        }
    }

    /// Push a frame for `contract`. Fails when the stack is full.
    pub fn enter(&mut self, contract: Address) -> Result<(), VmError> {
        if self.frames.len() >= self.max_depth as usize {
            return Err(VmError::Protocol {
                reason: format!("call depth limit {} exceeded", self.max_depth),
            });
        }
        self.frames.push(CallFrame { contract });
        Ok(())
    }

    /// Pop the top frame, verifying it belongs to `contract`.
    pub fn exit(&mut self, contract: Address) -> Result<(), VmError> {
        match self.frames.pop() {
            Some(frame) if frame.contract == contract => Ok(()),
            Some(frame) => Err(VmError::Protocol {
                reason: format!(
                    "context exit for {:?} but current frame is {:?}",
                    contract, frame.contract
                ),
            }),
            None => Err(VmError::Protocol {
                reason: "context exit with empty call stack".to_string(),
            }),
        }
    }

    /// The contract on top of the stack, or the zero address outside any
    /// frame.
    pub fn current_contract(&self) -> Address {
        self.frames
            .last()
            .map(|f| f.contract)
            .unwrap_or(ZERO_ADDRESS)
    }

    /// The nearest contract below the top that differs from it, or the zero
    /// address when none does. Self-calls are skipped, so a contract never
    /// observes itself as its own caller.
    pub fn caller(&self) -> Address {
        let top = match self.frames.last() {
            Some(frame) => frame.contract,
            None => return ZERO_ADDRESS,
        };
        self.frames
            .iter()
            .rev()
            .skip(1)
            .find(|f| f.contract != top)
            .map(|f| f.contract)
            .unwrap_or(ZERO_ADDRESS)
    }

    pub fn depth(&self) -> u8 {
        self.frames.len() as u8
    }

    /// Discard frames above `depth`. Used to unwind after a trapped callee,
    /// whose exits never ran.
    pub fn truncate(&mut self, depth: u8) {
        self.frames.truncate(depth as usize);
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}
