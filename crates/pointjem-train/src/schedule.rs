//! Warmup + cosine learning rate schedule.

/// Learning rate at `step`.
///
/// - Warmup: linear ramp from 0 to `base_lr` over `warmup_steps`
/// - Decay: cosine from `base_lr` to `base_lr * end_lr_frac` at `total_steps`
pub fn warmup_cosine(
    step: usize,
    warmup_steps: usize,
    total_steps: usize,
    base_lr: f64,
    end_lr_frac: f64,
) -> f64 {
    if step < warmup_steps {
        return base_lr * step as f64 / warmup_steps as f64;
    }

    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
    let progress = ((step - warmup_steps) as f64 / decay_steps as f64).min(1.0); // clamp past the end
    let q = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
    let end_lr = base_lr * end_lr_frac;
    base_lr * q + end_lr * (1.0 - q)
}
