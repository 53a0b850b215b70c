//! Object-level tests: the emitted bytes are validated with an independent
//! ELF reader (the `object` crate) plus raw header checks.

use object::{Object, ObjectSection, ObjectSymbol};
use opal_ir::builder::Builder;
use opal_ir::function::{Argument, Function};
use opal_ir::instruction::ICmpOp;
use opal_ir::module::{Init, Module};
use opal_ir::types::Type;

use crate::generate_object;

fn i32_ty() -> Type {
    Type::Int(32)
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

/// main() { return 42; }
fn ret42_module() -> Module {
    let mut module = Module::new("ret42.ir");
    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);
    let c = b.const_int(i32_ty(), 42);
    b.ret(Some(c));
    module.add_function(main);
    module
}

/// main() { return factorial(5); } with a recursive factorial.
fn factorial_module() -> Module {
    let mut module = Module::new("factorial.ir");

    let mut fact = Function::new("factorial", int_args(&["n"]), i32_ty());
    {
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
        let one_again = b.const_int(i32_ty(), 1);
        b.ret(Some(one_again));

        b.switch_to_block(rec);
        let one_rec = b.const_int(i32_ty(), 1);
        let nm1 = b.sub(n, one_rec, i32_ty());
        let sub_result = b.call("factorial", vec![nm1], i32_ty());
        let product = b.mul(n, sub_result, i32_ty());
        b.ret(Some(product));
    }
    module.add_function(fact);

    let mut main = Function::new("main", Vec::new(), i32_ty());
    {
        let mut b = Builder::new(&mut main);
        let entry = b.create_block("entry");
        b.switch_to_block(entry);
        let five = b.const_int(i32_ty(), 5);
        let r = b.call("factorial", vec![five], i32_ty());
        b.ret(Some(r));
    }
    module.add_function(main);
    module
}

fn counter_module() -> Module {
    let mut module = Module::new("counter.ir");
    let g = module.add_global("counter", Type::Int(64), Some(Init::Int(7)));

    let mut main = Function::new("main", Vec::new(), i32_ty());
    let mut b = Builder::new(&mut main);
    let entry = b.create_block("entry");
    b.switch_to_block(entry);
    let addr = b.global_addr(g, Type::Int(64));
    let v = b.load(addr, Type::Int(64));
    let t = b.trunc(v, i32_ty());
    b.ret(Some(t));
    module.add_function(main);
    module
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

#[test]
fn object_parses_as_amd64_elf() {
    let bytes = generate_object(&ret42_module()).unwrap();
    let obj = object::File::parse(&*bytes).expect("object crate should parse our output");
    assert_eq!(obj.architecture(), object::Architecture::X86_64);
    assert!(obj.is_64());
    assert!(obj.is_little_endian());
}

#[test]
fn text_section_holds_the_function_body() {
    let bytes = generate_object(&ret42_module()).unwrap();
    let obj = object::File::parse(&*bytes).unwrap();

    let text = obj.section_by_name(".text").expect(".text must exist");
    let code = text.data().unwrap();
    // push rbp; mov rbp, rsp ... leave; ret
    assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
    assert_eq!(&code[code.len() - 2..], &[0xC9, 0xC3]);
    assert_eq!(text.align(), 16);
}

#[test]
fn main_symbol_is_a_global_function() {
    let bytes = generate_object(&ret42_module()).unwrap();
    let obj = object::File::parse(&*bytes).unwrap();

    let main = obj
        .symbols()
        .find(|s| s.name() == Ok("main"))
        .expect("main symbol must exist");
    assert!(main.is_global());
    assert_eq!(main.kind(), object::SymbolKind::Text);
    assert_eq!(main.address(), 0);
    assert!(main.size() > 0);
}

#[test]
fn local_symbols_precede_globals() {
    let bytes = generate_object(&factorial_module()).unwrap();
    let obj = object::File::parse(&*bytes).unwrap();

    let mut seen_global = false;
    for sym in obj.symbols() {
        if sym.is_global() {
            seen_global = true;
        } else {
            assert!(!seen_global, "local symbol after a global one");
        }
    }
}

#[test]
fn recursive_call_produces_rela_text() {
    let bytes = generate_object(&factorial_module()).unwrap();
    let obj = object::File::parse(&*bytes).unwrap();

    let text = obj.section_by_name(".text").unwrap();
    let relocs: Vec<_> = text.relocations().collect();
    // factorial calls itself once, main calls factorial once.
    assert_eq!(relocs.len(), 2);
    for (_, reloc) in &relocs {
        assert_eq!(reloc.addend(), -4);
    }
}

#[test]
fn rela_text_cross_references_are_correct() {
    let bytes = generate_object(&factorial_module()).unwrap();

    // Walk the section headers directly for the sh_link/sh_info invariants.
    let shoff = u64_at(&bytes, 40) as usize;
    let shnum = u16_at(&bytes, 60) as usize;
    let shstrndx = u16_at(&bytes, 62) as usize;
    let shdr = |i: usize| &bytes[shoff + 64 * i..shoff + 64 * (i + 1)];

    let shstr_off = u64_at(shdr(shstrndx), 24) as usize;
    let name_of = |hdr: &[u8]| {
        let name_off = shstr_off + u32_at(hdr, 0) as usize;
        let end = bytes[name_off..].iter().position(|&b| b == 0).unwrap();
        String::from_utf8_lossy(&bytes[name_off..name_off + end]).into_owned()
    };

    let mut indices = std::collections::HashMap::new();
    for i in 0..shnum {
        indices.insert(name_of(shdr(i)), i);
    }

    let rela = shdr(indices[".rela.text"]);
    assert_eq!(u32_at(rela, 40), indices[".symtab"] as u32); // sh_link
    assert_eq!(u32_at(rela, 44), indices[".text"] as u32); // sh_info
    assert_eq!(u64_at(rela, 56), 24); // sh_entsize

    // Every relocation symbol index is non-null and in range.
    let symtab = shdr(indices[".symtab"]);
    let sym_count = u64_at(symtab, 32) / 24;
    let rela_off = u64_at(rela, 24) as usize;
    let rela_count = (u64_at(rela, 32) / 24) as usize;
    for i in 0..rela_count {
        let r_info = u64_at(&bytes, rela_off + 24 * i + 8);
        let sym_index = r_info >> 32;
        assert!(sym_index > 0 && sym_index < sym_count);
        let r_type = r_info as u32;
        assert_eq!(r_type, 4); // R_X86_64_PLT32
    }

    // symtab sh_info = 1 + number of locals.
    let sh_info = u32_at(symtab, 44) as u64;
    let sym_off = u64_at(symtab, 24) as usize;
    let mut locals = 0;
    for i in 1..sym_count as usize {
        let info = bytes[sym_off + 24 * i + 4];
        if info >> 4 == 0 {
            locals += 1;
        }
    }
    assert_eq!(sh_info, 1 + locals);
}

#[test]
fn globals_land_in_data_with_object_symbols() {
    let bytes = generate_object(&counter_module()).unwrap();
    let obj = object::File::parse(&*bytes).unwrap();

    let data = obj.section_by_name(".data").expect(".data must exist");
    assert_eq!(data.data().unwrap(), &7u64.to_le_bytes());
    assert_eq!(data.align(), 8);

    let counter = obj
        .symbols()
        .find(|s| s.name() == Ok("counter"))
        .expect("counter symbol must exist");
    assert!(counter.is_global());
    assert_eq!(counter.kind(), object::SymbolKind::Data);

    // The RIP-relative load against the global is a PC32 relocation.
    let text = obj.section_by_name(".text").unwrap();
    let relocs: Vec<_> = text.relocations().collect();
    assert_eq!(relocs.len(), 1);
}

#[test]
fn modules_without_data_omit_the_section() {
    let bytes = generate_object(&ret42_module()).unwrap();
    let obj = object::File::parse(&*bytes).unwrap();
    assert!(obj.section_by_name(".data").is_none());
    assert!(obj.section_by_name(".rela.text").is_none());
}

#[test]
fn object_emission_is_deterministic() {
    let a = generate_object(&factorial_module()).unwrap();
    let b = generate_object(&factorial_module()).unwrap();
    assert_eq!(a, b);
}
