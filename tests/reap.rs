use std::time::{Duration, Instant};

use anyhow::Result;
use cmdpipe::{Command, Registry, State};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Nobody waits here: the termination is observed purely through the
// signal flag and the two-pass collection in poll.
#[test]
fn poll_collects_background_terminations() -> Result<()> {
    init();
    let registry = Registry::new();
    registry.set_raise_on_error(true);

    let quick = Command::new(&registry, "true", "true", Vec::<String>::new());
    quick.start()?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !quick.is_state(State::Exited) {
        assert!(Instant::now() < deadline, "termination never collected");
        registry.poll();
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(quick.return_code(), Some(0));
    assert_eq!(registry.commands_in_state(State::Exited), vec![quick.id()]);
    assert_eq!(registry.commands_in_state(State::Running), Vec::new());
    Ok(())
}
