//! Shared fixtures: a hand-assembled guest module and its import table.
//!
//! The guest bump-allocates from 4096 upwards, keeps a shadow stack pointer
//! at 1024 and counts destructor runs and adapter invocations in globals so
//! tests can observe them through exports.
//!
//! Three closure flavours are wired up: `adapter` echoes its argument,
//! `try_adapter` reports through a return slot, and `drop_adapter` drops the
//! handle it is given while the call is still running.

#![allow(dead_code)]

use std::borrow::Cow;

use ferry_host::{AbiKind, HostImport, ImportTable, Instance, ModuleLoader, ReturnKind};
use ferry_runtime::{HostValue, Raised};
use ferry_types::{AbiValue, BridgeConfig};
use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, ElementSection, Elements, EntityType, ExportKind,
    ExportSection, Function, FunctionSection, GlobalSection, GlobalType, ImportSection,
    Instruction, MemorySection, MemoryType, Module, RefType, TableSection, TableType,
    TypeSection, ValType,
};

// ══════════════════════════════════════════════════════════════════════════════
// Layout
// ══════════════════════════════════════════════════════════════════════════════

const T_II_I: u32 = 0;
const T_II: u32 = 1;
const T_I: u32 = 2;
const T_I_I: u32 = 3;
const T_V_I: u32 = 4;
const T_III_I: u32 = 5;
const T_III: u32 = 6;
const T_IIII: u32 = 7;

// Imports, in declaration order.
const IMP_STRING_NEW: u32 = 0;
const IMP_LOG: u32 = 1;
const IMP_THROW: u32 = 2;
const IMP_DROP_REF: u32 = 3;
const IMP_JSON_PARSE: u32 = 4;
const IMP_MAKE_CLOSURE: u32 = 5;
const IMP_CB_DROP: u32 = 6;
const IMP_DEBUG_STRING: u32 = 7;
const IMP_SHOUT: u32 = 8;
const IMP_FAIL: u32 = 9;
const IMP_FUNCTION_CALL: u32 = 10;
const IMP_MAKE_TRY_CLOSURE: u32 = 11;
const IMP_MAKE_DROPPING_CLOSURE: u32 = 12;
const IMPORT_COUNT: u32 = 13;

// Defined functions.
const F_MALLOC: u32 = IMPORT_COUNT;
const F_ADD_SP: u32 = IMPORT_COUNT + 4;
const F_DTOR: u32 = IMPORT_COUNT + 5;

const G_HEAP: u32 = 0;
const G_SP: u32 = 1;
const G_EXN: u32 = 2;
const G_DTOR_CALLS: u32 = 3;
const G_INVOCATIONS: u32 = 4;
const G_LAST_DTOR: u32 = 5;
const G_INNER_DROP: u32 = 6;
const G_DTOR_SEEN: u32 = 7;

/// First address handed out by the guest allocator.
pub const HEAP_BASE: u32 = 4096;
/// Initial shadow stack pointer.
pub const STACK_TOP: u32 = 1024;
/// Scratch return area used by tests.
pub const RETPTR: u32 = 256;
/// Closure state passed by `new_closure`.
pub const CLOSURE_PTR: u32 = 64;
pub const CLOSURE_AUX: u32 = 7;
/// Destructor table slot holding the guest's closure destructor.
pub const DTOR_SLOT: u32 = 1;

fn memarg(offset: u64, align: u32) -> wasm_encoder::MemArg {
    wasm_encoder::MemArg {
        offset,
        align,
        memory_index: 0,
    }
}

fn mutable_i32(init: i32) -> (GlobalType, ConstExpr) {
    (
        GlobalType {
            val_type: ValType::I32,
            mutable: true,
            shared: false,
        },
        ConstExpr::i32_const(init),
    )
}

/// A function that forwards its parameters to `target` and returns
/// whatever it returns.
fn forward(params: u32, target: u32) -> Function {
    let mut f = Function::new(vec![]);
    for i in 0..params {
        f.instruction(&Instruction::LocalGet(i));
    }
    f.instruction(&Instruction::Call(target));
    f.instruction(&Instruction::End);
    f
}

fn read_global(global: u32) -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::GlobalGet(global));
    f.instruction(&Instruction::End);
    f
}

fn bump_global(f: &mut Function, global: u32) {
    f.instruction(&Instruction::GlobalGet(global));
    f.instruction(&Instruction::I32Const(1));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalSet(global));
}

// ══════════════════════════════════════════════════════════════════════════════
// Function bodies
// ══════════════════════════════════════════════════════════════════════════════

/// `malloc(size) -> ptr`: 8-aligned bump allocation, growing memory on demand.
fn emit_malloc() -> Function {
    let mut f = Function::new(vec![(2, ValType::I32)]);
    // ptr = (heap + 7) & -8
    f.instruction(&Instruction::GlobalGet(G_HEAP));
    f.instruction(&Instruction::I32Const(7));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(-8));
    f.instruction(&Instruction::I32And);
    f.instruction(&Instruction::LocalTee(1));
    // end = ptr + size
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::LocalSet(2));
    // if end > memory bytes: grow by the missing pages
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::MemorySize(0));
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32Shl);
    f.instruction(&Instruction::I32GtU);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::MemorySize(0));
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32Shl);
    f.instruction(&Instruction::I32Sub);
    f.instruction(&Instruction::I32Const(0xffff));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::I32ShrU);
    f.instruction(&Instruction::MemoryGrow(0));
    f.instruction(&Instruction::I32Const(-1));
    f.instruction(&Instruction::I32Eq);
    f.instruction(&Instruction::If(BlockType::Empty));
    f.instruction(&Instruction::Unreachable);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::GlobalSet(G_HEAP));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::End);
    f
}

/// `realloc(ptr, old, new) -> ptr`: allocate and copy `min(old, new)` bytes.
fn emit_realloc() -> Function {
    let mut f = Function::new(vec![(1, ValType::I32)]);
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::Call(F_MALLOC));
    f.instruction(&Instruction::LocalSet(3));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32LtU);
    f.instruction(&Instruction::Select);
    f.instruction(&Instruction::MemoryCopy {
        src_mem: 0,
        dst_mem: 0,
    });
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::End);
    f
}

fn emit_free() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::End);
    f
}

fn emit_exn_store() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::GlobalSet(G_EXN));
    f.instruction(&Instruction::End);
    f
}

fn emit_add_to_stack_pointer() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::GlobalGet(G_SP));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::I32Add);
    f.instruction(&Instruction::GlobalSet(G_SP));
    f.instruction(&Instruction::GlobalGet(G_SP));
    f.instruction(&Instruction::End);
    f
}

/// `dtor(ptr, aux)`: count the call and remember `ptr`.
fn emit_dtor() -> Function {
    let mut f = Function::new(vec![]);
    bump_global(&mut f, G_DTOR_CALLS);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::GlobalSet(G_LAST_DTOR));
    f.instruction(&Instruction::End);
    f
}

/// `adapter(ptr, aux, arg) -> handle`: count the call and hand the argument
/// back as the result.
fn emit_adapter() -> Function {
    let mut f = Function::new(vec![]);
    bump_global(&mut f, G_INVOCATIONS);
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::End);
    f
}

/// `try_adapter(retptr, ptr, aux, arg)`: write `(arg, aux)` into the slot,
/// so a closure made with `aux == 1` raises its argument back at the host.
fn emit_try_adapter() -> Function {
    let mut f = Function::new(vec![]);
    bump_global(&mut f, G_INVOCATIONS);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::I32Store(memarg(0, 2)));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Store(memarg(4, 2)));
    f.instruction(&Instruction::End);
    f
}

/// `drop_adapter(ptr, aux, arg) -> 0`: `cb_drop(arg)`, recording its result
/// and the destructor count seen from inside the call.
fn emit_drop_adapter() -> Function {
    let mut f = Function::new(vec![]);
    bump_global(&mut f, G_INVOCATIONS);
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::Call(IMP_CB_DROP));
    f.instruction(&Instruction::GlobalSet(G_INNER_DROP));
    f.instruction(&Instruction::GlobalGet(G_DTOR_CALLS));
    f.instruction(&Instruction::GlobalSet(G_DTOR_SEEN));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::End);
    f
}

/// `new_try_closure(aux) -> handle`.
fn emit_new_try_closure() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(CLOSURE_PTR as i32));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::Call(IMP_MAKE_TRY_CLOSURE));
    f.instruction(&Instruction::End);
    f
}

fn emit_new_dropping_closure() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(CLOSURE_PTR as i32));
    f.instruction(&Instruction::I32Const(CLOSURE_AUX as i32));
    f.instruction(&Instruction::Call(IMP_MAKE_DROPPING_CLOSURE));
    f.instruction(&Instruction::End);
    f
}

fn emit_new_closure() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::I32Const(CLOSURE_PTR as i32));
    f.instruction(&Instruction::I32Const(CLOSURE_AUX as i32));
    f.instruction(&Instruction::Call(IMP_MAKE_CLOSURE));
    f.instruction(&Instruction::End);
    f
}

/// `take_exn() -> handle`: the last stored exception, cleared.
fn emit_take_exn() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::GlobalGet(G_EXN));
    f.instruction(&Instruction::I32Const(0));
    f.instruction(&Instruction::GlobalSet(G_EXN));
    f.instruction(&Instruction::End);
    f
}

fn emit_grow() -> Function {
    let mut f = Function::new(vec![]);
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::MemoryGrow(0));
    f.instruction(&Instruction::End);
    f
}

/// `try_fail(ptr, len) -> handle`: call the fallible `fail` import with a
/// slot reserved on the shadow stack. Returns the error handle, or `-1` when
/// the flag is clear.
fn emit_try_fail() -> Function {
    let mut f = Function::new(vec![(2, ValType::I32)]);
    f.instruction(&Instruction::I32Const(-16));
    f.instruction(&Instruction::Call(F_ADD_SP));
    f.instruction(&Instruction::LocalSet(2));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::LocalGet(0));
    f.instruction(&Instruction::LocalGet(1));
    f.instruction(&Instruction::Call(IMP_FAIL));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Load(memarg(4, 2)));
    f.instruction(&Instruction::If(BlockType::Result(ValType::I32)));
    f.instruction(&Instruction::LocalGet(2));
    f.instruction(&Instruction::I32Load(memarg(0, 2)));
    f.instruction(&Instruction::Else);
    f.instruction(&Instruction::I32Const(-1));
    f.instruction(&Instruction::End);
    f.instruction(&Instruction::LocalSet(3));
    f.instruction(&Instruction::I32Const(16));
    f.instruction(&Instruction::Call(F_ADD_SP));
    f.instruction(&Instruction::Drop);
    f.instruction(&Instruction::LocalGet(3));
    f.instruction(&Instruction::End);
    f
}

// ══════════════════════════════════════════════════════════════════════════════
// Module
// ══════════════════════════════════════════════════════════════════════════════

/// Assemble the guest module.
pub fn guest_wasm() -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.ty().function(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
    types.ty().function(vec![ValType::I32, ValType::I32], vec![]);
    types.ty().function(vec![ValType::I32], vec![]);
    types.ty().function(vec![ValType::I32], vec![ValType::I32]);
    types.ty().function(vec![], vec![ValType::I32]);
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32, ValType::I32], vec![ValType::I32]);
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32, ValType::I32], vec![]);
    types
        .ty()
        .function(vec![ValType::I32, ValType::I32, ValType::I32, ValType::I32], vec![]);
    module.section(&types);

    let mut imports = ImportSection::new();
    let declared = [
        ("string_new", T_II_I),
        ("log", T_II),
        ("throw", T_II),
        ("object_drop_ref", T_I),
        ("json_parse", T_II_I),
        ("make_closure", T_II_I),
        ("cb_drop", T_I_I),
        ("debug_string", T_II),
        ("shout", T_II_I),
        ("fail", T_III),
        ("function_call", T_III),
        ("make_try_closure", T_II_I),
        ("make_dropping_closure", T_II_I),
    ];
    for (name, ty) in declared {
        imports.import("ferry", name, EntityType::Function(ty));
    }
    module.section(&imports);

    // (export name, type, body), in function index order from IMPORT_COUNT.
    let defined: Vec<(&str, u32, Function)> = vec![
        ("__ferry_malloc", T_I_I, emit_malloc()),
        ("__ferry_realloc", T_III_I, emit_realloc()),
        ("__ferry_free", T_II, emit_free()),
        ("__ferry_exn_store", T_I, emit_exn_store()),
        ("__ferry_add_to_stack_pointer", T_I_I, emit_add_to_stack_pointer()),
        ("dtor", T_II, emit_dtor()),
        ("adapter", T_III_I, emit_adapter()),
        ("make_string", T_II_I, forward(2, IMP_STRING_NEW)),
        ("parse", T_II_I, forward(2, IMP_JSON_PARSE)),
        ("raise", T_II, forward(2, IMP_THROW)),
        ("new_closure", T_V_I, emit_new_closure()),
        ("drop_closure", T_I_I, forward(1, IMP_CB_DROP)),
        ("drop_ref", T_I, forward(1, IMP_DROP_REF)),
        ("take_exn", T_V_I, emit_take_exn()),
        ("dtor_calls", T_V_I, read_global(G_DTOR_CALLS)),
        ("invocations", T_V_I, read_global(G_INVOCATIONS)),
        ("last_dtor", T_V_I, read_global(G_LAST_DTOR)),
        ("grow", T_I_I, emit_grow()),
        ("say", T_II, forward(2, IMP_LOG)),
        ("shout", T_II_I, forward(2, IMP_SHOUT)),
        ("try_fail", T_II_I, emit_try_fail()),
        ("describe", T_II, forward(2, IMP_DEBUG_STRING)),
        ("call_fn", T_III, forward(3, IMP_FUNCTION_CALL)),
        ("try_adapter", T_IIII, emit_try_adapter()),
        ("drop_adapter", T_III_I, emit_drop_adapter()),
        ("new_try_closure", T_I_I, emit_new_try_closure()),
        ("new_dropping_closure", T_V_I, emit_new_dropping_closure()),
        ("stack_pointer", T_V_I, read_global(G_SP)),
        ("inner_drop", T_V_I, read_global(G_INNER_DROP)),
        ("dtor_seen", T_V_I, read_global(G_DTOR_SEEN)),
    ];

    let mut functions = FunctionSection::new();
    for (_, ty, _) in &defined {
        functions.function(*ty);
    }
    module.section(&functions);

    let mut tables = TableSection::new();
    tables.table(TableType {
        element_type: RefType::FUNCREF,
        table64: false,
        minimum: 2,
        maximum: None,
        shared: false,
    });
    module.section(&tables);

    let mut memory = MemorySection::new();
    memory.memory(MemoryType {
        minimum: 1,
        maximum: Some(16),
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    module.section(&memory);

    let mut globals = GlobalSection::new();
    for init in [HEAP_BASE as i32, STACK_TOP as i32, 0, 0, 0, 0, -1, -1] {
        let (ty, expr) = mutable_i32(init);
        globals.global(ty, &expr);
    }
    module.section(&globals);

    let mut exports = ExportSection::new();
    exports.export("memory", ExportKind::Memory, 0);
    exports.export("__ferry_destructors", ExportKind::Table, 0);
    for (i, (name, _, _)) in defined.iter().enumerate() {
        exports.export(name, ExportKind::Func, IMPORT_COUNT + i as u32);
    }
    module.section(&exports);

    let mut elements = ElementSection::new();
    elements.active(
        Some(0),
        &ConstExpr::i32_const(DTOR_SLOT as i32),
        Elements::Functions(Cow::Borrowed(&[F_DTOR])),
    );
    module.section(&elements);

    let mut code = CodeSection::new();
    for (_, _, body) in &defined {
        code.function(body);
    }
    module.section(&code);

    module.finish()
}

// ══════════════════════════════════════════════════════════════════════════════
// Imports and loading
// ══════════════════════════════════════════════════════════════════════════════

/// Everything the guest imports.
pub fn import_table() -> ImportTable {
    ImportTable::new()
        .with_intrinsics()
        .closure_wrapper("make_closure", DTOR_SLOT, "adapter", false)
        .closure_wrapper("make_try_closure", DTOR_SLOT, "try_adapter", true)
        .closure_wrapper("make_dropping_closure", DTOR_SLOT, "drop_adapter", false)
        .host_function(
            "shout",
            HostImport::new(|_, args| {
                let text = args[0].as_str().unwrap_or_default();
                Ok(HostValue::String(text.to_uppercase()))
            })
            .params([AbiKind::Str])
            .returns(ReturnKind::Handle),
        )
        .host_function(
            "fail",
            HostImport::new(|_, args| {
                Err(Raised::error(
                    "RangeError",
                    format!("{} is out of range", args[0].as_str().unwrap_or("?")),
                ))
            })
            .params([AbiKind::Str])
            .fallible(),
        )
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn load() -> Instance {
    load_with(BridgeConfig::default())
}

pub fn load_with(config: BridgeConfig) -> Instance {
    init_tracing();
    ModuleLoader::new(config)
        .unwrap()
        .load(&guest_wasm(), &import_table())
        .unwrap()
}

/// Call an export that takes and returns `i32` words.
pub fn call(instance: &mut Instance, name: &str, args: &[i32]) -> Vec<i32> {
    let args: Vec<AbiValue> = args.iter().copied().map(AbiValue::from).collect();
    instance
        .call_export(name, &args)
        .unwrap_or_else(|e| panic!("{name} failed: {e}"))
        .into_iter()
        .map(|v| v.as_i32().unwrap())
        .collect()
}

/// Call an export returning a single `i32`.
pub fn call1(instance: &mut Instance, name: &str, args: &[i32]) -> i32 {
    call(instance, name, args)[0]
}

pub fn peek(instance: &Instance, ptr: u32, len: u32) -> Vec<u8> {
    let memory = instance.store().data().exports.unwrap().memory;
    memory.data(instance.store())[ptr as usize..(ptr + len) as usize].to_vec()
}

pub fn words(instance: &Instance, ptr: u32, n: u32) -> Vec<i32> {
    peek(instance, ptr, n * 4)
        .chunks_exact(4)
        .map(|w| i32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

/// Encode `text` into guest memory and return `[ptr, len]` as call args.
pub fn string_args(instance: &mut Instance, text: &str) -> [i32; 2] {
    let s = instance.pass_string(text).unwrap();
    [s.ptr as i32, s.len as i32]
}
