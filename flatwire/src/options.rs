use std::fmt::{Debug, Display, Formatter};

use crate::shared_string::{
    DEFAULT_SHARED_STRING_CAPACITY, SharedStringReaderFactory, SharedStringWriterFactory,
    direct_mapped_writer,
};

/// How a parsed buffer is materialized.
///
/// The mode is fixed for the lifetime of every object produced by a parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeserializationMode {
    /// Every access re-reads the buffer and returns a fresh handle.
    Lazy,
    /// Every field is decoded once on first access and cached on its parent.
    #[default]
    Progressive,
    /// The whole graph is copied out at parse time into immutable, buffer-free objects.
    Greedy,
    /// Like [`DeserializationMode::Greedy`], but objects and collections can be mutated.
    GreedyMutable,
}

impl DeserializationMode {
    /// Returns true for the modes that copy the whole graph out at parse time.
    pub fn is_eager(&self) -> bool {
        matches!(self, Self::Greedy | Self::GreedyMutable)
    }

    /// Returns true if objects produced in this mode accept arbitrary mutation.
    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::GreedyMutable)
    }
}

impl Display for DeserializationMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lazy => write!(f, "lazy"),
            Self::Progressive => write!(f, "progressive"),
            Self::Greedy => write!(f, "greedy"),
            Self::GreedyMutable => write!(f, "greedy-mutable"),
        }
    }
}

/// Limits that bound the work done by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorOptions {
    /// The deepest nesting of tables, vectors and unions accepted.
    pub max_depth: usize,
    /// The largest number of tables visited in one buffer.
    pub max_tables: usize,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_tables: 1_000_000,
        }
    }
}

/// Settings for a [`crate::Serializer`].
#[derive(Clone)]
pub struct SerializerOptions {
    deserialization_mode: DeserializationMode,
    shared_string_writer: Option<SharedStringWriterFactory>,
    shared_string_reader: Option<SharedStringReaderFactory>,
    enable_write_through: bool,
    share_vtables: bool,
    force_defaults: bool,
    validate_on_parse: bool,
    validator: ValidatorOptions,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            deserialization_mode: DeserializationMode::default(),
            shared_string_writer: Some(direct_mapped_writer(DEFAULT_SHARED_STRING_CAPACITY)),
            shared_string_reader: None,
            enable_write_through: true,
            share_vtables: true,
            force_defaults: false,
            validate_on_parse: false,
            validator: ValidatorOptions::default(),
        }
    }
}

impl SerializerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deserialization_mode(mut self, mode: DeserializationMode) -> Self {
        self.deserialization_mode = mode;
        self
    }

    pub fn with_shared_string_writer(mut self, factory: SharedStringWriterFactory) -> Self {
        self.shared_string_writer = Some(factory);
        self
    }

    /// Write every shared string in full at each occurrence.
    pub fn without_shared_strings(mut self) -> Self {
        self.shared_string_writer = None;
        self
    }

    pub fn with_shared_string_reader(mut self, factory: SharedStringReaderFactory) -> Self {
        self.shared_string_reader = Some(factory);
        self
    }

    /// When disabled, fields declared write-through behave as ordinary read-only fields.
    pub fn with_write_through(mut self, enable: bool) -> Self {
        self.enable_write_through = enable;
        self
    }

    pub fn with_share_vtables(mut self, share: bool) -> Self {
        self.share_vtables = share;
        self
    }

    /// Write scalar fields even when they are equal to their default.
    pub fn with_force_defaults(mut self, force: bool) -> Self {
        self.force_defaults = force;
        self
    }

    /// Run the validator on every buffer before parsing it.
    pub fn with_validate_on_parse(mut self, validate: bool) -> Self {
        self.validate_on_parse = validate;
        self
    }

    pub fn with_validator_options(mut self, validator: ValidatorOptions) -> Self {
        self.validator = validator;
        self
    }

    pub fn deserialization_mode(&self) -> DeserializationMode {
        self.deserialization_mode
    }

    pub fn shared_string_writer(&self) -> Option<&SharedStringWriterFactory> {
        self.shared_string_writer.as_ref()
    }

    pub fn shared_string_reader(&self) -> Option<&SharedStringReaderFactory> {
        self.shared_string_reader.as_ref()
    }

    pub fn enable_write_through(&self) -> bool {
        self.enable_write_through
    }

    pub fn share_vtables(&self) -> bool {
        self.share_vtables
    }

    pub fn force_defaults(&self) -> bool {
        self.force_defaults
    }

    pub fn validate_on_parse(&self) -> bool {
        self.validate_on_parse
    }

    pub fn validator(&self) -> ValidatorOptions {
        self.validator
    }
}

impl Debug for SerializerOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializerOptions")
            .field("deserialization_mode", &self.deserialization_mode)
            .field("shared_string_writer", &self.shared_string_writer.is_some())
            .field("shared_string_reader", &self.shared_string_reader.is_some())
            .field("enable_write_through", &self.enable_write_through)
            .field("share_vtables", &self.share_vtables)
            .field("force_defaults", &self.force_defaults)
            .field("validate_on_parse", &self.validate_on_parse)
            .field("validator", &self.validator)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let options = SerializerOptions::default();
        assert_eq!(options.deserialization_mode(), DeserializationMode::Progressive);
        assert!(options.shared_string_writer().is_some());
        assert!(options.shared_string_reader().is_none());
        assert!(options.enable_write_through());
        assert!(options.share_vtables());
        assert!(!options.force_defaults());
        assert!(!options.validate_on_parse());
        assert_eq!(options.validator().max_depth, 64);
    }

    #[test]
    fn builder_overrides() {
        let options = SerializerOptions::new()
            .with_deserialization_mode(DeserializationMode::GreedyMutable)
            .without_shared_strings()
            .with_write_through(false);
        assert!(options.deserialization_mode().is_eager());
        assert!(options.deserialization_mode().is_mutable());
        assert!(options.shared_string_writer().is_none());
        assert!(!options.enable_write_through());
        assert!(format!("{options:?}").contains("shared_string_writer: false"));
    }
}
