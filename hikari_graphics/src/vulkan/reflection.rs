/*! SPIR-V reflection.
 *
 * Walks the instruction stream once, collecting names, decorations and type
 * definitions, then resolves every interface variable into a named binding
 * plus the push constant range. Only the subset of SPIR-V that GLSL
 * interface declarations produce is handled.
 */

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use ash::vk;

const OP_NAME: u32 = spirv::Op::Name as u32;
const OP_DECORATE: u32 = spirv::Op::Decorate as u32;
const OP_MEMBER_DECORATE: u32 = spirv::Op::MemberDecorate as u32;
const OP_TYPE_INT: u32 = spirv::Op::TypeInt as u32;
const OP_TYPE_FLOAT: u32 = spirv::Op::TypeFloat as u32;
const OP_TYPE_VECTOR: u32 = spirv::Op::TypeVector as u32;
const OP_TYPE_MATRIX: u32 = spirv::Op::TypeMatrix as u32;
const OP_TYPE_IMAGE: u32 = spirv::Op::TypeImage as u32;
const OP_TYPE_SAMPLER: u32 = spirv::Op::TypeSampler as u32;
const OP_TYPE_SAMPLED_IMAGE: u32 = spirv::Op::TypeSampledImage as u32;
const OP_TYPE_ARRAY: u32 = spirv::Op::TypeArray as u32;
const OP_TYPE_RUNTIME_ARRAY: u32 = spirv::Op::TypeRuntimeArray as u32;
const OP_TYPE_STRUCT: u32 = spirv::Op::TypeStruct as u32;
const OP_TYPE_POINTER: u32 = spirv::Op::TypePointer as u32;
const OP_TYPE_ACCELERATION_STRUCTURE: u32 = spirv::Op::TypeAccelerationStructureKHR as u32;
const OP_CONSTANT: u32 = spirv::Op::Constant as u32;
const OP_VARIABLE: u32 = spirv::Op::Variable as u32;

const DECORATION_BLOCK: u32 = spirv::Decoration::Block as u32;
const DECORATION_BUFFER_BLOCK: u32 = spirv::Decoration::BufferBlock as u32;
const DECORATION_ARRAY_STRIDE: u32 = spirv::Decoration::ArrayStride as u32;
const DECORATION_BINDING: u32 = spirv::Decoration::Binding as u32;
const DECORATION_DESCRIPTOR_SET: u32 = spirv::Decoration::DescriptorSet as u32;
const DECORATION_OFFSET: u32 = spirv::Decoration::Offset as u32;

const STORAGE_UNIFORM_CONSTANT: u32 = spirv::StorageClass::UniformConstant as u32;
const STORAGE_UNIFORM: u32 = spirv::StorageClass::Uniform as u32;
const STORAGE_PUSH_CONSTANT: u32 = spirv::StorageClass::PushConstant as u32;
const STORAGE_STORAGE_BUFFER: u32 = spirv::StorageClass::StorageBuffer as u32;

/// One reflected descriptor binding, keyed by its GLSL name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingInfo {
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Declared array size; 0 for runtime arrays whose size the application
    /// decides at descriptor set layout creation.
    pub count: u32,
    pub runtime_array: bool,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Clone, Debug, Default)]
pub struct ShaderReflection {
    pub bindings: BTreeMap<String, BindingInfo>,
    pub push_constant_size: u32,
}

#[derive(Clone, Copy)]
enum TypeDef {
    Int {
        width: u32,
    },
    Float {
        width: u32,
    },
    Vector {
        component: u32,
        count: u32,
    },
    Matrix {
        column: u32,
        count: u32,
    },
    Image {
        sampled: u32,
    },
    Sampler,
    SampledImage,
    AccelerationStructure,
    Struct,
    Array {
        element: u32,
        length_id: u32,
    },
    RuntimeArray {
        element: u32,
    },
    Pointer {
        storage_class: u32,
        pointee: u32,
    },
}

#[derive(Default)]
struct ModuleInfo {
    names: HashMap<u32, String>,
    types: HashMap<u32, TypeDef>,
    constants: HashMap<u32, u32>,
    descriptor_sets: HashMap<u32, u32>,
    bindings: HashMap<u32, u32>,
    blocks: HashMap<u32, bool>,
    array_strides: HashMap<u32, u32>,
    struct_members: HashMap<u32, Vec<u32>>,
    member_offsets: HashMap<(u32, u32), u32>,
    variables: Vec<(u32, u32, u32)>,
}

fn decode_string(words: &[u32]) -> String {
    let mut bytes = Vec::new();
    'outer: for word in words {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                break 'outer;
            }
            bytes.push(byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn reflect_spirv(words: &[u32], stages: vk::ShaderStageFlags) -> Result<ShaderReflection> {
    if words.len() < 5 || words[0] != 0x0723_0203 {
        anyhow::bail!("Invalid SPIR-V module");
    }

    let mut info = ModuleInfo::default();
    let mut cursor = 5;
    while cursor < words.len() {
        let word = words[cursor];
        let opcode = word & 0xffff;
        let word_count = (word >> 16) as usize;
        if word_count == 0 || cursor + word_count > words.len() {
            anyhow::bail!("Malformed SPIR-V instruction stream");
        }
        let operands = &words[cursor + 1..cursor + word_count];
        parse_instruction(opcode, operands, &mut info);
        cursor += word_count;
    }

    let mut reflection = ShaderReflection::default();
    for &(type_id, result_id, storage_class) in &info.variables {
        let pointee = match info.types.get(&type_id) {
            Some(TypeDef::Pointer { pointee, .. }) => *pointee,
            _ => continue,
        };

        if storage_class == STORAGE_PUSH_CONSTANT {
            let size = struct_size(&info, pointee);
            reflection.push_constant_size = reflection.push_constant_size.max(size);
            continue;
        }

        let Some(descriptor_type) = classify_descriptor(&info, pointee, storage_class) else {
            continue;
        };

        let (count, runtime_array) = array_count(&info, pointee);
        let set = info.descriptor_sets.get(&result_id).copied().unwrap_or(0);
        let binding = info.bindings.get(&result_id).copied().unwrap_or(0);
        let name = info
            .names
            .get(&result_id)
            .filter(|name| !name.is_empty())
            .cloned()
            .or_else(|| info.names.get(&strip_arrays(&info, pointee)).cloned())
            .unwrap_or_else(|| format!("binding_{set}_{binding}"));

        reflection.bindings.insert(
            name,
            BindingInfo {
                set,
                binding,
                descriptor_type,
                count,
                runtime_array,
                stages,
            },
        );
    }

    Ok(reflection)
}

fn parse_instruction(opcode: u32, operands: &[u32], info: &mut ModuleInfo) {
    match opcode {
        OP_NAME => {
            if operands.len() >= 2 {
                info.names.insert(operands[0], decode_string(&operands[1..]));
            }
        }
        OP_DECORATE => {
            if operands.len() >= 2 {
                let target = operands[0];
                match operands[1] {
                    DECORATION_DESCRIPTOR_SET => {
                        info.descriptor_sets.insert(target, operands[2]);
                    }
                    DECORATION_BINDING => {
                        info.bindings.insert(target, operands[2]);
                    }
                    DECORATION_BLOCK => {
                        info.blocks.insert(target, false);
                    }
                    DECORATION_BUFFER_BLOCK => {
                        info.blocks.insert(target, true);
                    }
                    DECORATION_ARRAY_STRIDE => {
                        info.array_strides.insert(target, operands[2]);
                    }
                    _ => {}
                }
            }
        }
        OP_MEMBER_DECORATE => {
            if operands.len() >= 4 && operands[2] == DECORATION_OFFSET {
                info.member_offsets
                    .insert((operands[0], operands[1]), operands[3]);
            }
        }
        OP_TYPE_INT => {
            info.types.insert(operands[0], TypeDef::Int { width: operands[1] });
        }
        OP_TYPE_FLOAT => {
            info.types
                .insert(operands[0], TypeDef::Float { width: operands[1] });
        }
        OP_TYPE_VECTOR => {
            info.types.insert(
                operands[0],
                TypeDef::Vector {
                    component: operands[1],
                    count: operands[2],
                },
            );
        }
        OP_TYPE_MATRIX => {
            info.types.insert(
                operands[0],
                TypeDef::Matrix {
                    column: operands[1],
                    count: operands[2],
                },
            );
        }
        OP_TYPE_IMAGE => {
            // operands: result, sampled type, dim, depth, arrayed, ms, sampled, format, ...
            info.types.insert(
                operands[0],
                TypeDef::Image {
                    sampled: operands[6],
                },
            );
        }
        OP_TYPE_SAMPLER => {
            info.types.insert(operands[0], TypeDef::Sampler);
        }
        OP_TYPE_SAMPLED_IMAGE => {
            info.types.insert(operands[0], TypeDef::SampledImage);
        }
        OP_TYPE_ACCELERATION_STRUCTURE => {
            info.types.insert(operands[0], TypeDef::AccelerationStructure);
        }
        OP_TYPE_STRUCT => {
            info.types.insert(operands[0], TypeDef::Struct);
            info.struct_members
                .insert(operands[0], operands[1..].to_vec());
        }
        OP_TYPE_ARRAY => {
            info.types.insert(
                operands[0],
                TypeDef::Array {
                    element: operands[1],
                    length_id: operands[2],
                },
            );
        }
        OP_TYPE_RUNTIME_ARRAY => {
            info.types.insert(
                operands[0],
                TypeDef::RuntimeArray {
                    element: operands[1],
                },
            );
        }
        OP_TYPE_POINTER => {
            info.types.insert(
                operands[0],
                TypeDef::Pointer {
                    storage_class: operands[1],
                    pointee: operands[2],
                },
            );
        }
        OP_CONSTANT => {
            // Only 32-bit scalar constants matter here (array lengths).
            if operands.len() >= 3 {
                info.constants.insert(operands[1], operands[2]);
            }
        }
        OP_VARIABLE => {
            if operands.len() >= 3 {
                info.variables.push((operands[0], operands[1], operands[2]));
            }
        }
        _ => {}
    }
}

fn strip_arrays(info: &ModuleInfo, mut type_id: u32) -> u32 {
    loop {
        match info.types.get(&type_id) {
            Some(TypeDef::Array { element, .. }) => type_id = *element,
            Some(TypeDef::RuntimeArray { element }) => type_id = *element,
            _ => return type_id,
        }
    }
}

fn array_count(info: &ModuleInfo, type_id: u32) -> (u32, bool) {
    match info.types.get(&type_id) {
        Some(TypeDef::Array { length_id, .. }) => (
            info.constants.get(length_id).copied().unwrap_or(1),
            false,
        ),
        Some(TypeDef::RuntimeArray { .. }) => (0, true),
        _ => (1, false),
    }
}

fn classify_descriptor(
    info: &ModuleInfo,
    type_id: u32,
    storage_class: u32,
) -> Option<vk::DescriptorType> {
    let base = strip_arrays(info, type_id);
    match storage_class {
        STORAGE_UNIFORM_CONSTANT => match info.types.get(&base)? {
            TypeDef::SampledImage => Some(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            TypeDef::Image { sampled } => {
                if *sampled == 2 {
                    Some(vk::DescriptorType::STORAGE_IMAGE)
                } else {
                    Some(vk::DescriptorType::SAMPLED_IMAGE)
                }
            }
            TypeDef::Sampler => Some(vk::DescriptorType::SAMPLER),
            TypeDef::AccelerationStructure => Some(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
            _ => None,
        },
        STORAGE_UNIFORM => match info.blocks.get(&base) {
            Some(true) => Some(vk::DescriptorType::STORAGE_BUFFER),
            _ => Some(vk::DescriptorType::UNIFORM_BUFFER),
        },
        STORAGE_STORAGE_BUFFER => Some(vk::DescriptorType::STORAGE_BUFFER),
        _ => None,
    }
}

fn type_size(info: &ModuleInfo, type_id: u32) -> u32 {
    match info.types.get(&type_id) {
        Some(TypeDef::Int { width }) | Some(TypeDef::Float { width }) => width / 8,
        Some(TypeDef::Vector { component, count }) => type_size(info, *component) * count,
        Some(TypeDef::Matrix { column, count }) => type_size(info, *column) * count,
        Some(TypeDef::Array {
            element, length_id, ..
        }) => {
            let length = info.constants.get(length_id).copied().unwrap_or(1);
            let stride = info
                .array_strides
                .get(&type_id)
                .copied()
                .unwrap_or_else(|| type_size(info, *element));
            stride * length
        }
        Some(TypeDef::Struct) => struct_size(info, type_id),
        _ => 0,
    }
}

fn struct_size(info: &ModuleInfo, struct_id: u32) -> u32 {
    let Some(members) = info.struct_members.get(&struct_id) else {
        return 0;
    };
    let mut size = 0;
    for (index, &member) in members.iter().enumerate() {
        let offset = info
            .member_offsets
            .get(&(struct_id, index as u32))
            .copied()
            .unwrap_or(size);
        size = size.max(offset + type_size(info, member));
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inst(opcode: u32, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![opcode | (((operands.len() + 1) as u32) << 16)];
        words.extend_from_slice(operands);
        words
    }

    fn string_words(s: &str) -> Vec<u32> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        bytes
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn module(instructions: Vec<Vec<u32>>) -> Vec<u32> {
        let mut words = vec![0x0723_0203, 0x0001_0200, 0, 100, 0];
        for inst in instructions {
            words.extend(inst);
        }
        words
    }

    #[test]
    fn reflects_uniform_buffer_binding() {
        // %1 = float32, %2 = struct { float }, %3 = ptr Uniform %2,
        // %4 = variable, set 1 binding 3
        let mut name_op = vec![OP_NAME];
        name_op.push(4);
        name_op.extend(string_words("scene_params"));
        name_op[0] |= (name_op.len() as u32) << 16;

        let words = module(vec![
            name_op,
            inst(OP_DECORATE, &[2, DECORATION_BLOCK]),
            inst(OP_DECORATE, &[4, DECORATION_DESCRIPTOR_SET, 1]),
            inst(OP_DECORATE, &[4, DECORATION_BINDING, 3]),
            inst(OP_TYPE_FLOAT, &[1, 32]),
            inst(OP_TYPE_STRUCT, &[2, 1]),
            inst(OP_TYPE_POINTER, &[3, STORAGE_UNIFORM, 2]),
            inst(OP_VARIABLE, &[3, 4, STORAGE_UNIFORM]),
        ]);

        let reflection = reflect_spirv(&words, vk::ShaderStageFlags::COMPUTE).unwrap();
        let binding = reflection.bindings.get("scene_params").unwrap();
        assert_eq!(binding.set, 1);
        assert_eq!(binding.binding, 3);
        assert_eq!(binding.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(binding.count, 1);
        assert!(!binding.runtime_array);
    }

    #[test]
    fn reflects_storage_image_array_and_push_constants() {
        // Image array of 4 storage images + push constant struct of
        // { float; vec4 at offset 16 } = 32 bytes.
        let mut image_name = vec![OP_NAME];
        image_name.push(10);
        image_name.extend(string_words("out_layers"));
        image_name[0] |= (image_name.len() as u32) << 16;

        let words = module(vec![
            image_name,
            inst(OP_DECORATE, &[10, DECORATION_DESCRIPTOR_SET, 0]),
            inst(OP_DECORATE, &[10, DECORATION_BINDING, 2]),
            inst(OP_TYPE_FLOAT, &[1, 32]),
            inst(OP_TYPE_INT, &[2, 32]),
            inst(OP_CONSTANT, &[2, 3, 4]),
            // result, sampled type, dim, depth, arrayed, ms, sampled, format
            inst(OP_TYPE_IMAGE, &[5, 1, 1, 0, 0, 0, 2, 0]),
            inst(OP_TYPE_ARRAY, &[6, 5, 3]),
            inst(OP_TYPE_POINTER, &[7, STORAGE_UNIFORM_CONSTANT, 6]),
            inst(OP_VARIABLE, &[7, 10, STORAGE_UNIFORM_CONSTANT]),
            // push constants
            inst(OP_TYPE_VECTOR, &[11, 1, 4]),
            inst(OP_TYPE_STRUCT, &[12, 1, 11]),
            inst(OP_MEMBER_DECORATE, &[12, 0, DECORATION_OFFSET, 0]),
            inst(OP_MEMBER_DECORATE, &[12, 1, DECORATION_OFFSET, 16]),
            inst(OP_TYPE_POINTER, &[13, STORAGE_PUSH_CONSTANT, 12]),
            inst(OP_VARIABLE, &[13, 14, STORAGE_PUSH_CONSTANT]),
        ]);

        let reflection = reflect_spirv(&words, vk::ShaderStageFlags::COMPUTE).unwrap();
        let binding = reflection.bindings.get("out_layers").unwrap();
        assert_eq!(binding.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(binding.count, 4);
        assert_eq!(reflection.push_constant_size, 32);
    }

    #[test]
    fn runtime_arrays_are_flagged() {
        let mut name_op = vec![OP_NAME];
        name_op.push(9);
        name_op.extend(string_words("textures"));
        name_op[0] |= (name_op.len() as u32) << 16;

        let words = module(vec![
            name_op,
            inst(OP_DECORATE, &[9, DECORATION_DESCRIPTOR_SET, 1]),
            inst(OP_DECORATE, &[9, DECORATION_BINDING, 0]),
            inst(OP_TYPE_FLOAT, &[1, 32]),
            inst(OP_TYPE_IMAGE, &[2, 1, 1, 0, 0, 0, 1, 0]),
            inst(OP_TYPE_SAMPLED_IMAGE, &[3, 2]),
            inst(OP_TYPE_RUNTIME_ARRAY, &[4, 3]),
            inst(OP_TYPE_POINTER, &[5, STORAGE_UNIFORM_CONSTANT, 4]),
            inst(OP_VARIABLE, &[5, 9, STORAGE_UNIFORM_CONSTANT]),
        ]);

        let reflection = reflect_spirv(&words, vk::ShaderStageFlags::COMPUTE).unwrap();
        let binding = reflection.bindings.get("textures").unwrap();
        assert!(binding.runtime_array);
        assert_eq!(binding.count, 0);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
    }

    #[test]
    fn rejects_invalid_magic() {
        assert!(reflect_spirv(&[1, 2, 3, 4, 5], vk::ShaderStageFlags::COMPUTE).is_err());
    }
}
