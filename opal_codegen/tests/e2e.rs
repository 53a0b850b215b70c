//! End-to-end tests: IR -> machine code -> ELF object -> link with cc ->
//! run -> check the process exit code.

use std::fs;
use std::process::Command;

use opal_ir::builder::Builder;
use opal_ir::function::{Argument, Function};
use opal_ir::instruction::ICmpOp;
use opal_ir::module::Module;
use opal_ir::types::Type;

fn i32_ty() -> Type {
    Type::Int(32)
}

fn i64_ty() -> Type {
    Type::Int(64)
}

fn int_args(names: &[&str]) -> Vec<Argument> {
    names
        .iter()
        .map(|n| Argument {
            name: n.to_string(),
            ty: i32_ty(),
        })
        .collect()
}

fn cc_available() -> bool {
    Command::new("cc")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Compile the module, link it with cc, run it, and check the exit code.
fn link_and_run(name: &str, module: &Module, expected: i32) {
    if !cc_available() {
        eprintln!("skipping {name}: cc not available");
        return;
    }

    let bytes = opal_codegen::generate_object(module).expect("codegen should succeed");
    let dir = tempfile::tempdir().unwrap();

    let obj_path = dir.path().join(format!("{name}.o"));
    fs::write(&obj_path, &bytes).unwrap();

    let exe_path = dir.path().join(name);
    let link = Command::new("cc")
        .arg(&obj_path)
        .arg("-o")
        .arg(&exe_path)
        .output()
        .expect("failed to spawn cc");
    assert!(
        link.status.success(),
        "link failed for {name}: {}",
        String::from_utf8_lossy(&link.stderr)
    );

    let run = Command::new(&exe_path)
        .output()
        .expect("failed to run test binary");
    assert_eq!(
        run.status.code(),
        Some(expected),
        "{name} exited with {:?}, expected {expected}",
        run.status.code()
    );
}

/// main() { return 42; }
#[test]
fn returns_constant() {
    let mut module = Module::new("returns_constant.ir");
    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);
    let c = b.const_int(i32_ty(), 42);
    b.ret(Some(c));
    module.add_function(main);

    link_and_run("returns_constant", &module, 42);
}

/// main() { return (6*7) + (12/4) - 3; }
#[test]
fn arithmetic_chain() {
    let mut module = Module::new("arithmetic_chain.ir");
    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);

    let six = b.const_int(i32_ty(), 6);
    let seven = b.const_int(i32_ty(), 7);
    let product = b.mul(six, seven, i32_ty());

    let twelve = b.const_int(i32_ty(), 12);
    let four = b.const_int(i32_ty(), 4);
    let quotient = b.sdiv(twelve, four, i32_ty());

    let sum = b.add(product, quotient, i32_ty());
    let three = b.const_int(i32_ty(), 3);
    let result = b.sub(sum, three, i32_ty());
    b.ret(Some(result));
    module.add_function(main);

    link_and_run("arithmetic_chain", &module, 42);
}

fn recursive_factorial() -> Function {
    let mut fact = Function::new("factorial", int_args(&["n"]), i32_ty());
    let mut b = Builder::new(&mut fact);
    let entry = b.create_block("entry");
    let base = b.create_block("base");
    let rec = b.create_block("rec");

    b.switch_to_block(entry);
    let n = b.arg(0);
    let one = b.const_int(i32_ty(), 1);
    let is_base = b.icmp(ICmpOp::Sle, n, one);
    b.cond_br(is_base, base, rec);

    b.switch_to_block(base);
    let one_base = b.const_int(i32_ty(), 1);
    b.ret(Some(one_base));

    b.switch_to_block(rec);
    let one_rec = b.const_int(i32_ty(), 1);
    let nm1 = b.sub(n, one_rec, i32_ty());
    let rest = b.call("factorial", vec![nm1], i32_ty());
    let product = b.mul(n, rest, i32_ty());
    b.ret(Some(product));

    fact
}

/// main() { return factorial(5); }
#[test]
fn recursive_factorial_of_five() {
    let mut module = Module::new("factorial.ir");
    module.add_function(recursive_factorial());

    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);
    let five = b.const_int(i32_ty(), 5);
    let r = b.call("factorial", vec![five], i32_ty());
    b.ret(Some(r));
    module.add_function(main);

    link_and_run("factorial", &module, 120);
}

fn recursive_fibonacci() -> Function {
    let mut fib = Function::new("fibonacci", int_args(&["n"]), i32_ty());
    let mut b = Builder::new(&mut fib);
    let entry = b.create_block("entry");
    let base = b.create_block("base");
    let rec = b.create_block("rec");

    b.switch_to_block(entry);
    let n = b.arg(0);
    let one = b.const_int(i32_ty(), 1);
    let is_base = b.icmp(ICmpOp::Sle, n, one);
    b.cond_br(is_base, base, rec);

    b.switch_to_block(base);
    b.ret(Some(n));

    b.switch_to_block(rec);
    let one_rec = b.const_int(i32_ty(), 1);
    let nm1 = b.sub(n, one_rec, i32_ty());
    let f1 = b.call("fibonacci", vec![nm1], i32_ty());
    let two = b.const_int(i32_ty(), 2);
    let nm2 = b.sub(n, two, i32_ty());
    let f2 = b.call("fibonacci", vec![nm2], i32_ty());
    let sum = b.add(f1, f2, i32_ty());
    b.ret(Some(sum));

    fib
}

/// main() { return fibonacci(10); }
#[test]
fn recursive_fibonacci_of_ten() {
    let mut module = Module::new("fibonacci.ir");
    module.add_function(recursive_fibonacci());

    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);
    let ten = b.const_int(i32_ty(), 10);
    let r = b.call("fibonacci", vec![ten], i32_ty());
    b.ret(Some(r));
    module.add_function(main);

    link_and_run("fibonacci", &module, 55);
}

/// main() builds a five-element i32 array on the stack, stores (i+1)*5
/// into each element through GEPs, and returns element 1.
#[test]
fn stack_array_via_alloca_and_gep() {
    let mut module = Module::new("stack_array.ir");
    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);

    let five = b.const_int(i32_ty(), 5);
    let base = b.alloca(i32_ty(), Some(five));

    for i in 0..5i64 {
        let idx = b.const_int(i64_ty(), i);
        let slot = b.gep(base, i32_ty(), vec![idx], i32_ty());
        let value = b.const_int(i32_ty(), (i + 1) * 5);
        b.store(value, slot);
    }

    let one = b.const_int(i64_ty(), 1);
    let slot1 = b.gep(base, i32_ty(), vec![one], i32_ty());
    let v = b.load(slot1, i32_ty());
    b.ret(Some(v));
    module.add_function(main);

    link_and_run("stack_array", &module, 10);
}

/// main() { return 5 > 3 ? 10 : 20; } built with a conditional branch and
/// a phi at the join.
#[test]
fn branch_join_through_phi() {
    let mut module = Module::new("branch_phi.ir");
    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    let then_bb = b.create_block("then");
    let else_bb = b.create_block("else");
    let merge = b.create_block("merge");

    b.switch_to_block(entry);
    let five = b.const_int(i32_ty(), 5);
    let three = b.const_int(i32_ty(), 3);
    let ten = b.const_int(i32_ty(), 10);
    let twenty = b.const_int(i32_ty(), 20);
    let cond = b.icmp(ICmpOp::Sgt, five, three);
    b.cond_br(cond, then_bb, else_bb);

    b.switch_to_block(then_bb);
    b.br(merge);

    b.switch_to_block(else_bb);
    b.br(merge);

    b.switch_to_block(merge);
    let result = b.phi(vec![(ten, then_bb), (twenty, else_bb)], i32_ty());
    b.ret(Some(result));
    module.add_function(main);

    link_and_run("branch_phi", &module, 10);
}

/// main() { return -3 & 0xFF; } == 253.
#[test]
fn masking_negative_value() {
    let mut module = Module::new("mask.ir");
    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);
    let minus_three = b.const_int(i32_ty(), -3);
    let mask = b.const_int(i32_ty(), 0xFF);
    let masked = b.and(minus_three, mask, i32_ty());
    b.ret(Some(masked));
    module.add_function(main);

    link_and_run("mask", &module, 253);
}

/// sum(1, 2, 3, 4, 5, 6, 21) == 42, exercising both register and stack
/// argument passing.
#[test]
fn seven_argument_call() {
    let mut module = Module::new("sum7.ir");

    let mut sum = Function::new(
        "sum7",
        int_args(&["a", "b", "c", "d", "e", "f", "g"]),
        i32_ty(),
    );
    {
        let mut b = Builder::new(&mut sum);
        let entry = b.create_block("entry");
        b.switch_to_block(entry);
        let mut acc = b.arg(0);
        for i in 1..7 {
            let next = b.arg(i);
            acc = b.add(acc, next, i32_ty());
        }
        b.ret(Some(acc));
    }
    module.add_function(sum);

    let mut main = Function::new("main", Vec::new(), i32_ty());
    {
        let mut b = Builder::new(&mut main);
        let entry = b.create_block("entry");
        b.switch_to_block(entry);
        let args: Vec<_> = [1, 2, 3, 4, 5, 6, 21]
            .iter()
            .map(|&v| b.const_int(i32_ty(), v))
            .collect();
        let r = b.call("sum7", args, i32_ty());
        b.ret(Some(r));
    }
    module.add_function(main);

    link_and_run("sum7", &module, 42);
}
