//! Presence monitor - block until a badge is placed on any reader

use crate::domain::{DriverError, ReaderObservation};
use crate::io::driver::CardContext;
use tracing::trace;

/// Wait until some reader reports a card and return its index.
///
/// Observations start out unaware, so the first status-change call returns
/// at once with the readers' real states; a card that was already lying on
/// a reader is therefore reported too. Readers are checked in list order
/// before every wait, so when several become present together the lowest
/// index wins.
///
/// The wait has no timeout: this suspends the calling thread until the
/// hardware changes. Any driver error is returned to the caller.
pub fn wait_for_presence<C: CardContext>(
    ctx: &C,
    readers: &[String],
) -> Result<usize, DriverError> {
    let mut observations = ReaderObservation::for_readers(readers);

    loop {
        for (index, obs) in observations.iter_mut().enumerate() {
            if obs.is_present() {
                return Ok(index);
            }
            obs.acknowledge();
        }

        ctx.get_status_change(&mut observations, None)?;
        trace!(
            states = ?observations.iter().map(|o| o.event_state.bits()).collect::<Vec<_>>(),
            "presence_status_change"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DriverOp;
    use crate::io::driver::CardDriver;
    use crate::io::mock::{MockDriver, Step};

    fn readers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_single_reader_insert() {
        let driver = MockDriver::with_readers(["r0"]);
        driver.script([Step::insert("r0", vec![0x04])]);
        let ctx = driver.establish().unwrap();

        assert_eq!(wait_for_presence(&ctx, &readers(&["r0"])).unwrap(), 0);
        // One wait to learn the initial state, one for the insertion
        assert_eq!(driver.wait_calls(), 2);
    }

    #[test]
    fn test_card_already_present() {
        let driver = MockDriver::with_readers(["r0", "r1"]);
        driver.script([Step::insert("r1", vec![0x04])]);
        // Put the card down before the monitor starts
        {
            let ctx = driver.establish().unwrap();
            let mut obs = ReaderObservation::for_readers(&readers(&["r0", "r1"]));
            for o in obs.iter_mut() {
                o.current_state = crate::domain::EventState::EMPTY;
            }
            ctx.get_status_change(&mut obs, None).unwrap();
        }

        let ctx = driver.establish().unwrap();
        assert_eq!(wait_for_presence(&ctx, &readers(&["r0", "r1"])).unwrap(), 1);
    }

    #[test]
    fn test_lowest_index_wins_in_same_batch() {
        let driver = MockDriver::with_readers(["r0", "r1", "r2"]);
        driver.script([Step::Batch(vec![
            Step::insert("r2", vec![0x02]),
            Step::insert("r1", vec![0x01]),
        ])]);
        let ctx = driver.establish().unwrap();

        assert_eq!(wait_for_presence(&ctx, &readers(&["r0", "r1", "r2"])).unwrap(), 1);
    }

    #[test]
    fn test_first_present_reader_by_time() {
        let driver = MockDriver::with_readers(["r0", "r1", "r2"]);
        driver.script([Step::insert("r2", vec![0x02]), Step::insert("r0", vec![0x01])]);
        let ctx = driver.establish().unwrap();

        assert_eq!(wait_for_presence(&ctx, &readers(&["r0", "r1", "r2"])).unwrap(), 2);
        // The later insertion was never consumed
        assert_eq!(driver.remaining_steps(), 1);
    }

    #[test]
    fn test_no_op_changes_keep_waiting() {
        let driver = MockDriver::with_readers(["r0", "r1"]);
        driver.script([
            Step::remove("r0"),
            Step::Batch(vec![]),
            Step::insert("r1", vec![0x09]),
        ]);
        let ctx = driver.establish().unwrap();

        assert_eq!(wait_for_presence(&ctx, &readers(&["r0", "r1"])).unwrap(), 1);
    }

    #[test]
    fn test_index_in_bounds() {
        for n in 1..6 {
            let names: Vec<String> = (0..n).map(|i| format!("reader-{}", i)).collect();
            let driver = MockDriver::with_readers(names.clone());
            driver.script([Step::insert(names[n - 1].clone(), vec![0x01])]);
            let ctx = driver.establish().unwrap();

            let index = wait_for_presence(&ctx, &names).unwrap();
            assert!(index < n);
            assert_eq!(index, n - 1);
        }
    }

    #[test]
    fn test_wait_error_propagates() {
        let driver = MockDriver::with_readers(["r0"]);
        driver.script([Step::Fail("reader subsystem gone".to_string())]);
        let ctx = driver.establish().unwrap();

        let err = wait_for_presence(&ctx, &readers(&["r0"])).unwrap_err();
        assert_eq!(err.operation, DriverOp::StatusChange);
        assert_eq!(err.message, "reader subsystem gone");
    }
}
