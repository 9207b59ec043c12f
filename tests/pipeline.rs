use anyhow::Result;
use cmdpipe::{Command, Registry, State};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn three_stage_pipeline_preserves_bytes() -> Result<()> {
    init();
    let registry = Registry::new();
    registry.set_raise_on_error(true);

    let produce = Command::new(&registry, "printf", "printf", ["alpha\\nbeta\\ngamma\\n"]);
    produce.add_pipe_dest(1);

    let filter = Command::new(&registry, "grep", "grep", ["a"]);
    filter.add_pipe_src()?;
    filter.add_pipe_dest(1);

    let sorted = Command::new(&registry, "sort", "sort", ["-r"]);
    sorted.add_pipe_src()?;
    let output = sorted.add_string_dest(1);

    produce.start()?;
    filter.start()?;
    sorted.start()?;

    produce.wait()?;
    filter.wait()?;
    sorted.wait()?;

    assert_eq!(produce.state(), State::Exited);
    assert_eq!(filter.state(), State::Exited);
    assert_eq!(sorted.state(), State::Exited);
    assert_eq!(output.contents(), "gamma\nbeta\nalpha\n");
    Ok(())
}

#[test]
fn pipe_dest_merges_stdout_and_stderr() -> Result<()> {
    init();
    let registry = Registry::new();
    registry.set_raise_on_error(true);

    // a second add_pipe_dest on the same command extends the same pipe
    let noisy = Command::new(&registry, "sh", "sh", ["-c", "echo out; echo err >&2"]);
    noisy.add_pipe_dest(1);
    noisy.add_pipe_dest(2);

    let sorted = Command::new(&registry, "sort", "sort", Vec::<String>::new());
    sorted.add_pipe_src()?;
    let output = sorted.add_string_dest(1);

    noisy.start()?;
    sorted.start()?;
    noisy.wait()?;
    sorted.wait()?;

    assert_eq!(output.contents(), "err\nout\n");
    Ok(())
}

#[test]
fn string_source_feeds_a_pipeline() -> Result<()> {
    init();
    let registry = Registry::new();
    registry.set_raise_on_error(true);

    let upper = Command::new(&registry, "tr", "tr", ["a-z", "A-Z"]);
    upper.add_string_src("shouting\n");
    upper.add_pipe_dest(1);

    let sink = Command::new(&registry, "cat", "cat", Vec::<String>::new());
    sink.add_pipe_src()?;
    let output = sink.add_string_dest(1);

    upper.start()?;
    sink.start()?;
    upper.wait()?;
    sink.wait()?;

    assert_eq!(output.contents(), "SHOUTING\n");
    Ok(())
}
