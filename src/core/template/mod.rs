pub mod codec;

pub use codec::{
    decode_template, encode_template, is_precomputed_template, TemplateError, LEGACY_DECODE_LEN,
    TEMPLATE_MAGIC, TEMPLATE_MIN_LEN,
};
