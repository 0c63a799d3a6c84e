//! Removal monitor - block until the badge leaves its reader

use crate::domain::{DriverError, DriverOp, ReaderObservation};
use crate::io::driver::CardContext;
use tracing::trace;

/// Wait until the card on `readers[target]` is gone and return `target`.
///
/// Starts from fresh, unaware observations and therefore waits before it
/// checks: the first wait reports the current (present) state, and every
/// later one blocks until something changes. State changes on other readers
/// are acknowledged and ignored. One wait is issued per iteration for the
/// whole reader set.
///
/// Like the presence monitor this has no timeout; driver errors are
/// returned to the caller.
pub fn wait_for_removal<C: CardContext>(
    ctx: &C,
    readers: &[String],
    target: usize,
) -> Result<usize, DriverError> {
    if target >= readers.len() {
        return Err(DriverError::new(
            DriverOp::StatusChange,
            format!("removal target {} out of range for {} readers", target, readers.len()),
        ));
    }
    let mut observations = ReaderObservation::for_readers(readers);

    loop {
        ctx.get_status_change(&mut observations, None)?;

        let obs = &observations[target];
        trace!(reader = %obs.name, state = %obs.event_state, "removal_status_change");
        if !obs.is_present() {
            return Ok(target);
        }

        for obs in observations.iter_mut() {
            obs.acknowledge();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::driver::CardDriver;
    use crate::io::mock::{MockDriver, Step};

    fn readers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Driver with a card already lying on `reader`
    fn driver_with_card(names: &[&str], reader: &str) -> MockDriver {
        let driver = MockDriver::with_readers(names.iter().copied());
        driver.script([Step::insert(reader, vec![0x04])]);
        let ctx = driver.establish().unwrap();
        crate::services::presence::wait_for_presence(&ctx, &readers(names)).unwrap();
        driver
    }

    #[test]
    fn test_returns_after_removal() {
        let driver = driver_with_card(&["r0"], "r0");
        driver.script([Step::remove("r0")]);
        let ctx = driver.establish().unwrap();

        assert_eq!(wait_for_removal(&ctx, &readers(&["r0"]), 0).unwrap(), 0);
        assert_eq!(driver.remaining_steps(), 0);
    }

    #[test]
    fn test_ignores_other_readers() {
        let names = ["r0", "r1", "r2"];
        let driver = driver_with_card(&names, "r1");
        driver.script([
            // r0 was empty all along; its changes must not end the wait
            Step::insert("r0", vec![0x01]),
            Step::remove("r0"),
            Step::insert("r2", vec![0x02]),
            Step::remove("r1"),
        ]);
        let ctx = driver.establish().unwrap();

        assert_eq!(wait_for_removal(&ctx, &readers(&names), 1).unwrap(), 1);
        assert_eq!(driver.remaining_steps(), 0);
    }

    #[test]
    fn test_does_not_return_while_present() {
        let driver = driver_with_card(&["r0", "r1"], "r1");
        // Script runs out while the card is still on r1
        driver.script([Step::insert("r0", vec![0x01])]);
        let ctx = driver.establish().unwrap();

        let err = wait_for_removal(&ctx, &readers(&["r0", "r1"]), 1).unwrap_err();
        assert_eq!(err.message, "mock script exhausted");
    }

    #[test]
    fn test_removed_in_batch_with_other_insert() {
        let driver = driver_with_card(&["r0", "r1"], "r0");
        driver.script([Step::Batch(vec![Step::remove("r0"), Step::insert("r1", vec![0x01])])]);
        let ctx = driver.establish().unwrap();

        assert_eq!(wait_for_removal(&ctx, &readers(&["r0", "r1"]), 0).unwrap(), 0);
    }

    #[test]
    fn test_wait_error_propagates() {
        let driver = driver_with_card(&["r0"], "r0");
        driver.script([Step::Fail("reader unplugged".to_string())]);
        let ctx = driver.establish().unwrap();

        let err = wait_for_removal(&ctx, &readers(&["r0"]), 0).unwrap_err();
        assert_eq!(err.operation, DriverOp::StatusChange);
    }

    #[test]
    fn test_target_out_of_range_is_error() {
        let driver = MockDriver::with_readers(["r0"]);
        let ctx = driver.establish().unwrap();

        let err = wait_for_removal(&ctx, &readers(&["r0"]), 1).unwrap_err();
        assert_eq!(err.operation, DriverOp::StatusChange);
        assert!(err.message.contains("out of range"));
        assert_eq!(driver.wait_calls(), 0);
    }
}
