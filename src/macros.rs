//! Validation macros.

/// Abort on a violated invariant.
///
/// Logs the message on the `critical` target and panics. Used for
/// programmer errors where carrying on would leave GPU state inconsistent:
/// stale handle access, recording into a closed command buffer, mismatched
/// render targets.
#[macro_export]
macro_rules! gfx_validate {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            let message = format!($($arg)+);
            log::error!(target: "critical", "{}", message);
            panic!("{}", message);
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_validate_passes() {
        gfx_validate!(1 + 1 == 2, "math is broken");
    }

    #[test]
    #[should_panic(expected = "bad value 3")]
    fn test_validate_panics() {
        let value = 3;
        gfx_validate!(value < 2, "bad value {}", value);
    }
}
