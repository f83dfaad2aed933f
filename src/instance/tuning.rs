//! Per-class accelerator tuning applied after launch.

/// Commands keyed by instance-class prefix. The first matching prefix wins.
const TUNING: &[(&str, &[&str])] = &[
    (
        "RENDER-",
        &[
            "nvidia-smi -pm 1",
            "nvidia-smi --auto-boost-default=0",
            "nvidia-smi -ac 715,1328",
        ],
    ),
    (
        "GPU-3070",
        &["nvidia-smi -pm 1", "nvidia-smi --auto-boost-default=0"],
    ),
    (
        "L4-",
        &[
            "nvidia-smi -pm 1",
            "nvidia-smi --auto-boost-default=0",
            "nvidia-smi -ac 6251,2040",
        ],
    ),
    (
        "L40S-",
        &["nvidia-smi -pm 1", "nvidia-smi --auto-boost-default=0"],
    ),
    ("H100-", &["nvidia-smi -pm 1"]),
];

/// Returns the tuning commands for `instance_type`, empty when the class
/// has no accelerator.
#[must_use]
pub fn commands_for(instance_type: &str) -> &'static [&'static str] {
    let upper = instance_type.to_ascii_uppercase();
    TUNING
        .iter()
        .find(|(prefix, _)| upper.starts_with(prefix))
        .map(|&(_, commands)| commands)
        .unwrap_or_default()
}
