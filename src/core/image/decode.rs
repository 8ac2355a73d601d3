// src/core/image/decode.rs
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::GrayImage;

use super::ConditionError;

/// Normalizes the incoming base64 payload: strips any `data:*;base64,`
/// header, drops whitespace, and repairs missing `=` padding. Clients are
/// inconsistent about all three.
pub fn clean_base64(input: &str) -> String {
    let body = match input.find(";base64,") {
        Some(pos) if input.starts_with("data:") => &input[pos + ";base64,".len()..],
        _ => input,
    };
    let mut cleaned: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let rem = cleaned.len() % 4;
    if rem != 0 {
        for _ in rem..4 {
            cleaned.push('=');
        }
    }
    cleaned
}

/// Decodes a base64 string into a grayscale pixel buffer.
pub fn decode_base64_image(input: &str) -> Result<GrayImage, ConditionError> {
    let cleaned = clean_base64(input);
    let bytes = STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|_| ConditionError::DecodeFailed)?;
    let img = image::load_from_memory(&bytes).map_err(|_| ConditionError::DecodeFailed)?;
    Ok(img.to_luma8())
}
