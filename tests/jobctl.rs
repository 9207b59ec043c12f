use std::time::Duration;

use anyhow::Result;
use cmdpipe::{Command, Registry, State};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn pause_resume_stop() -> Result<()> {
    init();
    let registry = Registry::new();
    registry.set_raise_on_error(true);

    let sleeper = Command::new(&registry, "sleep", "sleep", ["30"]);
    sleeper.start()?;
    assert_eq!(sleeper.state(), State::Running);
    let pid = sleeper.pid().unwrap();
    assert_eq!(registry.lookup_pid(pid), Some(sleeper.id()));

    sleeper.pause()?;
    sleeper.wait()?;
    assert_eq!(sleeper.state(), State::Stopped);
    assert_eq!(sleeper.signal_num(), Some(Signal::SIGSTOP as i32));
    assert_eq!(registry.commands_in_state(State::Stopped), vec![sleeper.id()]);

    sleeper.resume()?;
    assert_eq!(sleeper.state(), State::Running);

    // stop is also valid from Stopped; here from Running
    sleeper.stop()?;
    sleeper.wait()?;
    assert_eq!(sleeper.state(), State::Signalled);
    assert_eq!(sleeper.signal_num(), Some(Signal::SIGTERM as i32));

    // terminal stop, observed through the plain pid wait
    let tstopped = Command::new(&registry, "sleep", "sleep", ["30"]);
    tstopped.start()?;
    tstopped.tstop()?;
    tstopped.wait_pid()?;
    assert_eq!(tstopped.state(), State::Stopped);
    assert_eq!(tstopped.signal_num(), Some(Signal::SIGTSTP as i32));
    tstopped.resume()?;
    tstopped.stop()?;
    tstopped.wait_pid()?;
    assert_eq!(tstopped.state(), State::Signalled);

    // dropping a handle with a live process kills and forgets it; the
    // finished commands above keep their registrations until their handles go
    let orphan = Command::new(&registry, "sleep", "sleep", ["30"]);
    orphan.start()?;
    let orphan_pid = Pid::from_raw(orphan.pid().unwrap());
    drop(orphan);
    assert_eq!(registry.commands(), vec![sleeper.id(), tstopped.id()]);
    let mut reaped = false;
    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(20));
        registry.poll();
        if nix::sys::signal::kill(orphan_pid, None).is_err() {
            reaped = true;
            break;
        }
    }
    assert!(reaped, "dropped command still alive");

    Ok(())
}
