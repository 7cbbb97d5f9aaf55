use base64::Engine;

use crate::error::ApiError;

/// Lowest PCM rate accepted from clients
const MIN_SAMPLE_RATE: u32 = 8_000;
/// Highest PCM rate accepted from clients
const MAX_SAMPLE_RATE: u32 = 48_000;
/// Bytes per 16-bit PCM sample
const PCM16_WIDTH: usize = 2;

/// Decode and validate the audio of a frame request. Returns raw PCM16 bytes.
pub fn validate_frame_request(
    audio_base64: &str,
    sample_rate: u32,
    max_chunk_ms: u64,
) -> Result<Vec<u8>, ApiError> {
    if audio_base64.trim().is_empty() {
        return Err(ApiError::InvalidInput("Audio cannot be empty".to_string()));
    }
    let pcm = base64::engine::general_purpose::STANDARD
        .decode(audio_base64.trim())
        .map_err(|e| ApiError::InvalidInput(format!("Audio is not valid base64: {}", e)))?;
    validate_pcm_chunk(&pcm, sample_rate, max_chunk_ms)?;
    Ok(pcm)
}

/// Validate one raw PCM16 chunk before it reaches the synthesizer.
pub fn validate_pcm_chunk(pcm: &[u8], sample_rate: u32, max_chunk_ms: u64) -> Result<(), ApiError> {
    validate_sample_rate(sample_rate)?;
    if pcm.is_empty() {
        return Err(ApiError::InvalidInput("Audio chunk is empty".to_string()));
    }
    if pcm.len() % PCM16_WIDTH != 0 {
        return Err(ApiError::InvalidInput(format!(
            "Audio chunk has odd length {} (expected 16-bit PCM)",
            pcm.len()
        )));
    }
    let samples = (pcm.len() / PCM16_WIDTH) as u64;
    let duration_ms = samples * 1000 / sample_rate as u64;
    if duration_ms > max_chunk_ms {
        return Err(ApiError::InvalidInput(format!(
            "Audio chunk too long: {} ms (max {} ms)",
            duration_ms, max_chunk_ms
        )));
    }
    Ok(())
}

pub fn validate_sample_rate(sample_rate: u32) -> Result<(), ApiError> {
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
        return Err(ApiError::InvalidInput(format!(
            "Invalid sample rate: {} (expected {}-{} Hz)",
            sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_validate_frame_request_valid() {
        let pcm = vec![0u8; 640];
        assert_eq!(validate_frame_request(&encode(&pcm), 16_000, 1000).unwrap(), pcm);
    }

    #[test]
    fn test_validate_frame_request_empty() {
        let result = validate_frame_request("", 16_000, 1000);
        assert!(result.is_err());
        if let Err(ApiError::InvalidInput(msg)) = result {
            assert!(msg.contains("empty"));
        }
    }

    #[test]
    fn test_validate_frame_request_bad_base64() {
        let result = validate_frame_request("not base64 !!", 16_000, 1000);
        assert!(matches!(result, Err(ApiError::InvalidInput(msg)) if msg.contains("base64")));
    }

    #[test]
    fn test_validate_pcm_chunk_odd_length() {
        let result = validate_pcm_chunk(&[0u8; 3], 16_000, 1000);
        assert!(matches!(result, Err(ApiError::InvalidInput(msg)) if msg.contains("odd")));
    }

    #[test]
    fn test_validate_pcm_chunk_too_long() {
        // 200 ms at 16 kHz
        let pcm = vec![0u8; 6400];
        assert!(validate_pcm_chunk(&pcm, 16_000, 200).is_ok());
        assert!(validate_pcm_chunk(&pcm, 16_000, 100).is_err());
    }

    #[test]
    fn test_validate_sample_rate() {
        assert!(validate_sample_rate(16_000).is_ok());
        assert!(validate_sample_rate(24_000).is_ok());
        assert!(validate_sample_rate(0).is_err());
        assert!(validate_sample_rate(96_000).is_err());
    }
}
