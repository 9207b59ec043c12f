use anyhow::Result;
use cmdpipe::{Command, Registry, State};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// The status sweep reaps any child of this process, so everything that
// forks and waits lives in this one test.
#[test]
fn runs_commands_with_redirections() -> Result<()> {
    init();
    let registry = Registry::new();
    registry.set_raise_on_error(true);

    // exit codes
    let ok = Command::new(&registry, "true", "true", Vec::<String>::new());
    ok.start()?;
    ok.wait()?;
    assert_eq!(ok.state(), State::Exited);
    assert_eq!(ok.return_code(), Some(0));

    let failing = Command::new(&registry, "sh", "sh", ["-c", "exit 7"]);
    failing.start()?;
    failing.wait()?;
    assert_eq!(failing.return_code(), Some(7));

    // a program that cannot be executed surfaces as the sentinel exit code
    let missing = Command::new(
        &registry,
        "definitely-not-a-program",
        "definitely-not-a-program",
        Vec::<String>::new(),
    );
    missing.start()?;
    missing.wait()?;
    assert_eq!(missing.return_code(), Some(255));

    // captured output
    let echo = Command::new(&registry, "echo", "echo", ["-n", "captured"]);
    let captured = echo.add_string_dest(1);
    echo.start()?;
    echo.wait()?;
    assert_eq!(captured.contents(), "captured");

    // string input through cat and back out
    let cat = Command::new(&registry, "cat", "cat", Vec::<String>::new());
    cat.add_string_src("round trip\n");
    let echoed = cat.add_string_dest(1);
    cat.start()?;
    cat.wait()?;
    assert_eq!(echoed.contents(), "round trip\n");

    // file input
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("input.txt");
    std::fs::write(&input, "from a file\n")?;
    let reader = Command::new(&registry, "cat", "cat", Vec::<String>::new());
    reader.add_file_src(&input);
    let contents = reader.add_string_dest(1);
    reader.start()?;
    reader.wait()?;
    assert_eq!(contents.contents(), "from a file\n");

    // command-line convenience entry point
    let spawned = registry.exec_command("echo hello")?.unwrap();
    spawned.wait()?;
    assert_eq!(spawned.state(), State::Exited);
    assert!(registry.exec_command("   ")?.is_none());

    // file destination policy: plain write, then no-clobber, then append
    let path = dir.path().join("out.txt");
    let first = Command::new(&registry, "echo", "echo", ["one"]);
    first.add_file_dest(&path, 1);
    first.start()?;
    first.wait()?;
    assert_eq!(std::fs::read_to_string(&path)?, "one\n");

    // no-clobber refuses the existing file before touching it
    let second = Command::new(&registry, "echo", "echo", ["two"]);
    second.add_file_dest(&path, 1);
    second.set_file_dest_overwrite(false, 1);
    assert!(second.start().is_err());
    assert!(registry.last_error().unwrap().contains("File exists"));
    assert_eq!(std::fs::read_to_string(&path)?, "one\n");

    let third = Command::new(&registry, "echo", "echo", ["three"]);
    third.add_file_dest(&path, 1);
    third.set_file_dest_append(true, 1);
    third.start()?;
    third.wait()?;
    assert_eq!(std::fs::read_to_string(&path)?, "one\nthree\n");

    // append without overwrite insists the file already exists
    let absent = dir.path().join("absent.txt");
    let fourth = Command::new(&registry, "echo", "echo", ["four"]);
    fourth.add_file_dest(&absent, 1);
    fourth.set_file_dest_append(true, 1);
    fourth.set_file_dest_overwrite(false, 1);
    assert!(fourth.start().is_err());
    assert!(!absent.exists());

    Ok(())
}
