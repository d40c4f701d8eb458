use std::rc::Rc;

use crate::decode::{decoder_for, DecodeFn};
use crate::errors::ClawError;
use crate::wire::FieldType;

/// Runtime schema metadata for one field of a struct type.
///
/// Struct-typed descriptors carry the nested mapping; a self-referential
/// descriptor leaves it out and the runtime substitutes the enclosing
/// mapping at decode time.
pub struct FieldDescriptor {
    pub name: String,
    pub field_num: u16,
    pub field_type: FieldType,
    pub mapping: Option<Rc<Mapping>>,
    pub self_referential: bool,
    pub(crate) decoder: DecodeFn,
}

/// The immutable schema descriptor for one message type. Built once by the
/// generated code (or by hand in tests) and shared by reference between
/// every `Struct` instance of the type.
pub struct Mapping {
    pub name: String,
    fields: Vec<FieldDescriptor>,
}

impl Mapping {
    pub fn builder(name: impl Into<String>) -> MappingBuilder {
        MappingBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Descriptor lookup; field numbers are dense, so this is an index.
    pub fn field(&self, field_num: u16) -> Result<&FieldDescriptor, ClawError> {
        self.fields
            .get(usize::from(field_num))
            .ok_or(ClawError::UnknownField { field: field_num })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Resolves the mapping a nested struct (or struct-list element) uses.
    pub fn nested(self: &Rc<Self>, desc: &FieldDescriptor) -> Result<Rc<Mapping>, ClawError> {
        match &desc.mapping {
            Some(mapping) => Ok(Rc::clone(mapping)),
            None if desc.self_referential => Ok(Rc::clone(self)),
            None => Err(ClawError::InvalidMapping(format!(
                "field {} ({}) has no nested mapping",
                desc.field_num, desc.name
            ))),
        }
    }

    /// Identity key used by the per-mapping struct pools.
    pub(crate) fn key(self: &Rc<Self>) -> usize {
        Rc::as_ptr(self) as usize
    }
}

struct PendingField {
    name: String,
    field_type: FieldType,
    mapping: Option<Rc<Mapping>>,
    self_referential: bool,
}

/// Builds a [`Mapping`]. Field numbers are assigned in declaration order,
/// starting at zero; the wire format is append-only, so new fields go at
/// the end.
pub struct MappingBuilder {
    name: String,
    fields: Vec<PendingField>,
}

impl MappingBuilder {
    /// Declares a scalar, bytes/string or non-struct list field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(PendingField {
            name: name.into(),
            field_type,
            mapping: None,
            self_referential: false,
        });
        self
    }

    /// Declares a nested struct field.
    #[must_use]
    pub fn struct_field(mut self, name: impl Into<String>, nested: &Rc<Mapping>) -> Self {
        self.fields.push(PendingField {
            name: name.into(),
            field_type: FieldType::Struct,
            mapping: Some(Rc::clone(nested)),
            self_referential: false,
        });
        self
    }

    /// Declares a list-of-structs field.
    #[must_use]
    pub fn list_struct_field(mut self, name: impl Into<String>, nested: &Rc<Mapping>) -> Self {
        self.fields.push(PendingField {
            name: name.into(),
            field_type: FieldType::ListStructs,
            mapping: Some(Rc::clone(nested)),
            self_referential: false,
        });
        self
    }

    /// Declares a struct field whose type is the enclosing type itself.
    #[must_use]
    pub fn self_struct_field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(PendingField {
            name: name.into(),
            field_type: FieldType::Struct,
            mapping: None,
            self_referential: true,
        });
        self
    }

    /// Declares a list-of-structs field of the enclosing type itself.
    #[must_use]
    pub fn self_list_struct_field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(PendingField {
            name: name.into(),
            field_type: FieldType::ListStructs,
            mapping: None,
            self_referential: true,
        });
        self
    }

    pub fn build(self) -> Result<Rc<Mapping>, ClawError> {
        if self.fields.len() > usize::from(u16::MAX) + 1 {
            return Err(ClawError::InvalidMapping(format!(
                "{}: {} fields exceed the 16-bit field number space",
                self.name,
                self.fields.len()
            )));
        }

        let mut fields = Vec::with_capacity(self.fields.len());

        for (index, pending) in self.fields.into_iter().enumerate() {
            let field_num = index as u16;

            match pending.field_type {
                FieldType::Unknown(tag) => {
                    return Err(ClawError::InvalidMapping(format!(
                        "{}: field {} declared with unassigned tag {}",
                        self.name, pending.name, tag
                    )));
                }
                FieldType::Struct | FieldType::ListStructs => {
                    if pending.mapping.is_none() && !pending.self_referential {
                        return Err(ClawError::InvalidMapping(format!(
                            "{}: struct field {} needs a nested mapping",
                            self.name, pending.name
                        )));
                    }
                }
                _ => {
                    if pending.mapping.is_some() || pending.self_referential {
                        return Err(ClawError::InvalidMapping(format!(
                            "{}: non-struct field {} cannot carry a mapping",
                            self.name, pending.name
                        )));
                    }
                }
            }

            // Decoder dispatch is resolved here, once, so the hot path is a
            // plain function-pointer call.
            fields.push(FieldDescriptor {
                name: pending.name,
                field_num,
                field_type: pending.field_type,
                mapping: pending.mapping,
                self_referential: pending.self_referential,
                decoder: decoder_for(pending.field_type),
            });
        }

        Ok(Rc::new(Mapping {
            name: self.name,
            fields,
        }))
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .finish()
    }
}
