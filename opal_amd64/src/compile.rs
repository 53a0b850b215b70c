//! Module compilation: globals into the data buffer, functions into the
//! text buffer, producing a relocatable [`Artifact`].

use opal_ir::module::{Global, Init, Module};
use opal_ir::types::Type;
use opal_target::{Artifact, Error, Result, SymbolDef, SymbolKind};

use crate::abi;
use crate::lower;

/// Compile a module to machine code and initialized data.
///
/// Globals are laid out first, each aligned to 8 bytes. Function bodies are
/// lowered in definition order and concatenated; declarations (functions
/// without blocks) produce neither code nor symbols. Relocation offsets in
/// the result are relative to the start of the text buffer.
pub fn compile_module(module: &Module) -> Result<Artifact> {
    let mut artifact = Artifact::default();

    for global in &module.globals {
        while artifact.data.len() % 8 != 0 {
            artifact.data.push(0);
        }
        let offset = artifact.data.len() as u64;
        emit_global(&mut artifact.data, global)?;
        artifact.symbols.push(SymbolDef {
            name: global.name.clone(),
            offset,
            size: artifact.data.len() as u64 - offset,
            kind: SymbolKind::Object,
        });
    }

    for func in &module.functions {
        if func.is_declaration() {
            continue;
        }
        let lowered = lower::lower_function(module, func)?;
        let base = artifact.text.len() as u64;
        for mut reloc in lowered.relocations {
            reloc.offset += base;
            artifact.relocations.push(reloc);
        }
        artifact.text.extend_from_slice(&lowered.code);
        artifact.symbols.push(SymbolDef {
            name: func.name.clone(),
            offset: base,
            size: lowered.code.len() as u64,
            kind: SymbolKind::Function,
        });
    }

    log::debug!(
        "compiled module `{}`: {} text bytes, {} data bytes, {} symbols, {} relocations",
        module.name,
        artifact.text.len(),
        artifact.data.len(),
        artifact.symbols.len(),
        artifact.relocations.len()
    );
    Ok(artifact)
}

fn emit_global(data: &mut Vec<u8>, global: &Global) -> Result<()> {
    match &global.init {
        None => {
            data.extend(std::iter::repeat(0u8).take(abi::size_of(&global.ty) as usize));
            Ok(())
        }
        Some(init) => emit_init(data, init, &global.ty, &global.name),
    }
}

/// Serialize an initializer against its declared type, little-endian, with
/// struct-field padding taken from the ABI layout.
fn emit_init(data: &mut Vec<u8>, init: &Init, ty: &Type, global: &str) -> Result<()> {
    match (init, ty) {
        (Init::Zero, _) => {
            data.extend(std::iter::repeat(0u8).take(abi::size_of(ty) as usize));
            Ok(())
        }

        (Init::Int(v), _) => {
            let bytes = v.to_le_bytes();
            let size = abi::size_of(ty) as usize;
            match size {
                1 | 2 | 4 | 8 => data.extend_from_slice(&bytes[..size]),
                _ => {
                    // Wide integers store the value in their low 8 bytes.
                    data.extend_from_slice(&bytes);
                    data.extend(std::iter::repeat(0u8).take(size.saturating_sub(8)));
                }
            }
            Ok(())
        }

        (Init::Float(v), Type::Float(32)) => {
            data.extend_from_slice(&(*v as f32).to_le_bytes());
            Ok(())
        }
        (Init::Float(v), _) => {
            data.extend_from_slice(&v.to_le_bytes());
            Ok(())
        }

        (Init::Array(elems), Type::Array { elem, .. }) => {
            for e in elems {
                emit_init(data, e, elem, global)?;
            }
            Ok(())
        }

        (Init::Struct(inits), Type::Struct { fields, packed }) => {
            let start = data.len() as u64;
            for (i, (init, field)) in inits.iter().zip(fields.iter()).enumerate() {
                let field_offset = abi::struct_field_offset(fields, *packed, i);
                while (data.len() as u64) < start + field_offset {
                    data.push(0);
                }
                emit_init(data, init, field, global)?;
            }
            let total = abi::size_of(ty);
            while (data.len() as u64) < start + total {
                data.push(0);
            }
            Ok(())
        }

        _ => Err(Error::layout(format!(
            "initializer shape does not match type of global `{global}`"
        ))),
    }
}
