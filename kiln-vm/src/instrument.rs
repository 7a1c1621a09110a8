//! Bytecode instrumentation.
//!
//! Deployed modules are rewritten once, before compilation, to carry their
//! own accounting:
//!
//! 1. Three imports are prepended in the host namespace: `consume_gas(i64)`,
//!    `ctx_enter()`, and `ctx_exit()`.
//! 2. Every instruction sequence of every local function (the function body
//!    plus each `block`, `loop`, `if` and `else` arm) gets a charge at its
//!    entry proportional to the number of statements it contains, so a
//!    backward branch pays for the loop body on every iteration.
//! 3. Every exported local function except the ABI utilities is re-pointed
//!    at a synthesized wrapper that brackets the original with `ctx_enter`
//!    and `ctx_exit`. The wrappers themselves are unmetered; a trap abandons
//!    the invocation wholesale, so no unwind bookkeeping is needed.
//!
//! The rewrite is deterministic: identical input yields identical output.

use walrus::ir::{Call, Const, Instr, InstrSeqId, Value};
use walrus::{ExportItem, FunctionBuilder, FunctionId, FunctionKind, LocalFunction, Module, ValType};

use crate::error::VmError;
use crate::gas::GAS_PER_STATEMENT;
use crate::protocol::{HOST_MODULE, RESERVED_EXPORTS};

pub const IMPORT_CONSUME_GAS: &str = "consume_gas";
pub const IMPORT_CTX_ENTER: &str = "ctx_enter";
pub const IMPORT_CTX_EXIT: &str = "ctx_exit";

/// Rewrite `wasm` with gas metering and call-context tracking. Fails on
/// unparseable input, in which case nothing of the deployment survives.
pub fn instrument(wasm: &[u8]) -> Result<Vec<u8>, VmError> {
    let mut module = Module::from_buffer(wasm).map_err(|e| VmError::Instrumentation {
        reason: format!("failed to parse module: {e}"),
    })?;

    let gas_ty = module.types.add(&[ValType::I64], &[]);
    let (consume_gas, _) = module.add_import_func(HOST_MODULE, IMPORT_CONSUME_GAS, gas_ty);
    let unit_ty = module.types.add(&[], &[]);
    let (ctx_enter, _) = module.add_import_func(HOST_MODULE, IMPORT_CTX_ENTER, unit_ty);
    let (ctx_exit, _) = module.add_import_func(HOST_MODULE, IMPORT_CTX_EXIT, unit_ty);

    let local_ids: Vec<FunctionId> = module.funcs.iter_local().map(|(id, _)| id).collect();
    for id in &local_ids {
        if let FunctionKind::Local(func) = &mut module.funcs.get_mut(*id).kind {
            meter_function(func, consume_gas);
        }
    }

    wrap_exports(&mut module, ctx_enter, ctx_exit);

    Ok(module.emit_wasm())
}

/// Insert a `consume_gas` charge at the entry of every instruction sequence
/// in the function. Costs are computed before any insertion so the injected
/// instructions are not themselves billed.
fn meter_function(func: &mut LocalFunction, consume_gas: FunctionId) {
    let mut seqs: Vec<InstrSeqId> = vec![func.entry_block()];
    let mut cursor = 0;
    while cursor < seqs.len() {
        let seq_id = seqs[cursor];
        cursor += 1;
        for (instr, _) in &func.block(seq_id).instrs {
            match instr {
                Instr::Block(b) => seqs.push(b.seq),
                Instr::Loop(l) => seqs.push(l.seq),
                Instr::IfElse(ie) => {
                    seqs.push(ie.consequent);
                    seqs.push(ie.alternative);
                }
                _ => {}
            }
        }
    }

    let costs: Vec<(InstrSeqId, u64)> = seqs
        .into_iter()
        .map(|id| {
            let count = func.block(id).instrs.len() as u64;
            (id, count.saturating_mul(GAS_PER_STATEMENT))
        })
        .collect();

    for (seq_id, cost) in costs {
        if cost == 0 {
            continue;
        }
        let mut seq = func.builder_mut().instr_seq(seq_id);
        seq.instr_at(
            0,
            Const {
                value: Value::I64(cost as i64),
            },
        );
        seq.instr_at(1, Call { func: consume_gas });
    }
}

/// Re-point each exported local function (except the ABI utilities) at an
/// unmetered wrapper that calls `ctx_enter`, forwards the arguments, and
/// calls `ctx_exit` on the way out.
fn wrap_exports(module: &mut Module, ctx_enter: FunctionId, ctx_exit: FunctionId) {
    let targets: Vec<(walrus::ExportId, FunctionId)> = module
        .exports
        .iter()
        .filter_map(|export| match export.item {
            ExportItem::Function(func) => Some((export.id(), func, export.name.as_str())),
            _ => None,
        })
        .filter(|(_, func, name)| {
            !RESERVED_EXPORTS.contains(name)
                && matches!(module.funcs.get(*func).kind, FunctionKind::Local(_))
        })
        .map(|(id, func, _)| (id, func))
        .collect();

    for (export_id, func_id) in targets {
        let ty = module.funcs.get(func_id).ty();
        let (params, results) = module.types.params_results(ty);
        let (params, results) = (params.to_vec(), results.to_vec());

        let mut builder = FunctionBuilder::new(&mut module.types, &params, &results);
        let args: Vec<walrus::LocalId> = params.iter().map(|ty| module.locals.add(*ty)).collect();
        let mut body = builder.func_body();
        body.call(ctx_enter);
        for arg in &args {
            body.local_get(*arg);
        }
        body.call(func_id);
        body.call(ctx_exit);
        let wrapper = builder.finish(args, &mut module.funcs);

        module.exports.get_mut(export_id).item = ExportItem::Function(wrapper);
    }
}
