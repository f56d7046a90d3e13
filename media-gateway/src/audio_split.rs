//! Per-line PCM splitting for grouped synthesis responses: given one
//! contiguous PCM-16 mono buffer and a line-weight list (word counts),
//! reconstruct a per-line chunk list ordered by `lineIndex`, preferring a
//! pause-boundary split and falling back to a proportional duration split.
//!
//! Grounded on `gemini_multi_speaker.py`'s `_build_duration_boundaries`,
//! `_detect_pause_boundaries`, and `split_int16_pcm_for_lines`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    Pause,
    Duration,
    Silence,
}

pub struct SplitResult {
    pub chunks: Vec<Vec<u8>>,
    pub mode: SplitMode,
    pub silence_fallback: bool,
}

/// ~10ms of silence at 24kHz mono 16-bit: 240 samples * 2 bytes.
const SILENCE_CHUNK_BYTES: usize = 240 * 2;

pub fn split_int16_pcm_for_lines(pcm_bytes: &[u8], line_weights: &[f64]) -> Result<SplitResult, String> {
    if pcm_bytes.len() % 2 != 0 {
        return Err("audio payload has invalid PCM length".into());
    }
    let line_count = line_weights.len().max(1);
    if line_count == 1 {
        return Ok(SplitResult { chunks: vec![pcm_bytes.to_vec()], mode: SplitMode::Duration, silence_fallback: false });
    }

    let samples: Vec<i16> = pcm_bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();
    let sample_count = samples.len();

    if sample_count == 0 {
        return Ok(SplitResult {
            chunks: vec![pcm_bytes.to_vec()],
            mode: SplitMode::Duration,
            silence_fallback: false,
        });
    }

    if sample_count <= line_count {
        let mut chunks = Vec::with_capacity(line_count);
        let mut start = 0usize;
        for idx in 0..line_count {
            let end = if idx < line_count - 1 { (start + 1).min(sample_count) } else { sample_count };
            chunks.push(samples_to_bytes(&samples[start..end.max(start)]));
            start = end.max(start);
        }
        return Ok(SplitResult { chunks, mode: SplitMode::Duration, silence_fallback: false });
    }

    let duration_boundaries = build_duration_boundaries(sample_count, line_weights, line_count - 1);
    let pause_boundaries = detect_pause_boundaries(&samples, &duration_boundaries);
    let use_pause = pause_boundaries.len() == line_count - 1;
    let boundaries = if use_pause { pause_boundaries } else { duration_boundaries };

    let mut normalized = Vec::with_capacity(boundaries.len());
    let mut prev = 0usize;
    for (idx, boundary) in boundaries.iter().enumerate() {
        let remaining = (line_count - 1) - idx;
        let min_allowed = prev + 1;
        let max_allowed = sample_count.saturating_sub(remaining).max(min_allowed);
        let bounded = (*boundary).clamp(min_allowed, max_allowed);
        normalized.push(bounded);
        prev = bounded;
    }

    let mut chunks = Vec::with_capacity(line_count);
    let mut start = 0usize;
    for end in normalized.iter().copied().chain(std::iter::once(sample_count)) {
        let end = end.max(start);
        chunks.push(samples_to_bytes(&samples[start..end]));
        start = end;
    }
    let mut silence_fallback = false;
    while chunks.len() < line_count {
        chunks.push(vec![0u8; SILENCE_CHUNK_BYTES]);
        silence_fallback = true;
    }
    chunks.truncate(line_count);

    Ok(SplitResult {
        chunks,
        mode: if use_pause { SplitMode::Pause } else { SplitMode::Duration },
        silence_fallback,
    })
}

fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

fn build_duration_boundaries(total_samples: usize, weights: &[f64], boundary_count: usize) -> Vec<usize> {
    if total_samples == 0 || boundary_count == 0 {
        return Vec::new();
    }
    let required = boundary_count + 1;
    let mut safe_weights: Vec<f64> = weights.iter().map(|w| w.max(1.0)).collect();
    if safe_weights.len() < required {
        safe_weights.resize(required, 1.0);
    }
    safe_weights.truncate(required);
    let total_weight: f64 = safe_weights.iter().sum::<f64>().max(required as f64);

    let mut boundaries = Vec::with_capacity(boundary_count);
    let mut cumulative = 0.0;
    let mut prev = 0usize;
    for idx in 0..boundary_count {
        cumulative += safe_weights[idx];
        let remaining = boundary_count - idx;
        let target = ((cumulative / total_weight) * total_samples as f64).round() as isize;
        let min_allowed = prev + 1;
        let max_allowed = total_samples.saturating_sub(remaining).max(min_allowed);
        let bounded = (target.max(min_allowed as isize) as usize).min(max_allowed);
        boundaries.push(bounded);
        prev = bounded;
    }
    boundaries
}

fn detect_pause_boundaries(samples: &[i16], targets: &[usize]) -> Vec<usize> {
    if targets.is_empty() {
        return Vec::new();
    }
    let sample_count = samples.len();
    if sample_count == 0 {
        return Vec::new();
    }

    let probe_stride = (sample_count / 4000).max(1);
    let mut probe_values: Vec<i32> = (0..sample_count)
        .step_by(probe_stride)
        .map(|i| (samples[i] as i32).abs())
        .collect();
    if probe_values.is_empty() {
        return Vec::new();
    }
    probe_values.sort_unstable();
    let quiet_index = ((probe_values.len() - 1) as f64 * 0.2) as usize;
    let quiet_floor = probe_values[quiet_index];
    let avg_amp = probe_values.iter().sum::<i32>() / probe_values.len().max(1) as i32;
    let threshold = (quiet_floor * 2).max((avg_amp as f64 * 0.25) as i32).clamp(120, 3000);

    let min_run = (sample_count / 200).clamp(240, 2400);

    let mut centers = Vec::new();
    let mut cursor = 0usize;
    while cursor < sample_count {
        if (samples[cursor] as i32).abs() > threshold {
            cursor += 1;
            continue;
        }
        let start = cursor;
        while cursor < sample_count && (samples[cursor] as i32).abs() <= threshold {
            cursor += 1;
        }
        if cursor - start >= min_run {
            centers.push((start + cursor) / 2);
        }
    }

    if centers.is_empty() {
        return Vec::new();
    }

    let tolerance = (sample_count / (targets.len() * 2).max(4)).max(200);
    let mut selected = Vec::with_capacity(targets.len());
    let mut used = vec![false; centers.len()];
    let mut prev_boundary = 0usize;

    for target in targets {
        let mut best_idx: Option<usize> = None;
        let mut best_delta = usize::MAX;
        for (idx, center) in centers.iter().enumerate() {
            if used[idx] || *center <= prev_boundary + 1 {
                continue;
            }
            let delta = center.abs_diff(*target);
            if delta < best_delta {
                best_delta = delta;
                best_idx = Some(idx);
            }
        }
        let Some(idx) = best_idx else { return Vec::new() };
        if best_delta > tolerance {
            return Vec::new();
        }
        let chosen = centers[idx];
        selected.push(chosen);
        used[idx] = true;
        prev_boundary = chosen;
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(sample_count: usize, amplitude: i16) -> Vec<u8> {
        let mut out = Vec::with_capacity(sample_count * 2);
        for _ in 0..sample_count {
            out.extend_from_slice(&amplitude.to_le_bytes());
        }
        out
    }

    #[test]
    fn single_line_returns_whole_buffer() {
        let pcm = tone(100, 1000);
        let result = split_int16_pcm_for_lines(&pcm, &[5.0]).unwrap();
        assert_eq!(result.chunks.len(), 1);
        assert_eq!(result.chunks[0].len(), pcm.len());
    }

    #[test]
    fn duration_fallback_produces_expected_chunk_count() {
        let pcm = tone(4000, 500);
        let result = split_int16_pcm_for_lines(&pcm, &[1.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(result.chunks.len(), 4);
        let total: usize = result.chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, pcm.len());
    }

    #[test]
    fn rejects_odd_length_pcm() {
        let pcm = vec![0u8; 3];
        assert!(split_int16_pcm_for_lines(&pcm, &[1.0, 1.0]).is_err());
    }
}
