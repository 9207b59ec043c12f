use anyhow::Result;
use cmdpipe::{Command, Registry, State};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn commands_share_a_process_group() -> Result<()> {
    init();
    let registry = Registry::new();
    registry.set_raise_on_error(true);

    let leader = Command::new(&registry, "sleep", "sleep", ["30"]);
    leader.set_process_group_leader();
    leader.start()?;
    assert_eq!(leader.pgid(), leader.pid());

    let member = Command::new(&registry, "sleep", "sleep", ["30"]);
    member.set_process_group(&leader);
    member.start()?;
    assert_eq!(member.pgid(), leader.pid());

    member.stop()?;
    member.wait()?;
    assert_eq!(member.state(), State::Signalled);

    leader.stop()?;
    leader.wait_pgid()?;
    assert_eq!(leader.state(), State::Signalled);

    Ok(())
}
