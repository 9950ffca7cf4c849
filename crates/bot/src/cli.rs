use anyhow::Context as _;

pub struct Args {
    pub nogui: bool,
    pub worker_threads: usize,
    pub network_threads: usize,
    pub peer_factories: usize,
    pub command: Command,
}

pub enum Command {
    Livestream {
        streamer_id: String,
        viewer_count: usize,
    },
    Conference {
        room_count: usize,
        user_per_room: usize,
        base_room_id: usize,
    },
}

pub fn print_usage() {
    println!("load_test_bot - SFU load-test harness");
    println!();
    println!("USAGE:");
    println!("    load_test_bot [OPTIONS] <livestream|conference> [MODE OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --nogui                      Disable the terminal dashboard");
    println!("    -w, --worker-thread <N>      Worker queues for session scripts [default: 4]");
    println!("    -n, --network-thread <N>     Network runtime threads [default: 4]");
    println!("    -p, --peer-factory <N>       Peer-connection factories [default: 1]");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
    println!();
    println!("MODE livestream:");
    println!("    -i, --streamer-id <ID>       Stream to watch [default: 1174393215]");
    println!("    -v, --viewer <N>             Number of viewers [default: 10]");
    println!();
    println!("MODE conference:");
    println!("    -r, --room-count <N>         Number of rooms [default: 10]");
    println!("    -u, --user-per-room <N>      Users per room [default: 4]");
    println!("    --rid <N>                    Base room id [default: 0]");
}

/// Parse the command line. `Ok(None)` means usage was printed and the
/// process should exit cleanly.
pub fn parse_args() -> anyhow::Result<Option<Args>> {
    let argv: Vec<String> = std::env::args().collect();

    let mut nogui = false;
    let mut worker_threads = 4usize;
    let mut network_threads = 4usize;
    let mut peer_factories = 1usize;
    let mut command = None;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("load_test_bot {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--nogui" => nogui = true,
            "-w" | "--worker-thread" => {
                i += 1;
                worker_threads = parse_count(&argv, i, "--worker-thread")?;
            }
            "-n" | "--network-thread" => {
                i += 1;
                network_threads = parse_count(&argv, i, "--network-thread")?;
            }
            "-p" | "--peer-factory" => {
                i += 1;
                peer_factories = parse_count(&argv, i, "--peer-factory")?;
            }
            "livestream" => {
                command = Some(parse_livestream(&argv[i + 1..])?);
                break;
            }
            "conference" => {
                command = Some(parse_conference(&argv[i + 1..])?);
                break;
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    let Some(command) = command else {
        print_usage();
        return Ok(None);
    };

    Ok(Some(Args {
        nogui,
        worker_threads,
        network_threads,
        peer_factories,
        command,
    }))
}

fn parse_livestream(argv: &[String]) -> anyhow::Result<Command> {
    let mut streamer_id = "1174393215".to_owned();
    let mut viewer_count = 10usize;

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-i" | "--streamer-id" => {
                i += 1;
                streamer_id = argv
                    .get(i)
                    .context("missing --streamer-id value")?
                    .clone();
            }
            "-v" | "--viewer" => {
                i += 1;
                viewer_count = parse_count(argv, i, "--viewer")?;
            }
            other => anyhow::bail!("unknown livestream argument: {other}"),
        }
        i += 1;
    }

    Ok(Command::Livestream {
        streamer_id,
        viewer_count,
    })
}

fn parse_conference(argv: &[String]) -> anyhow::Result<Command> {
    let mut room_count = 10usize;
    let mut user_per_room = 4usize;
    let mut base_room_id = 0usize;

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "-r" | "--room-count" => {
                i += 1;
                room_count = parse_count(argv, i, "--room-count")?;
            }
            "-u" | "--user-per-room" => {
                i += 1;
                user_per_room = parse_count(argv, i, "--user-per-room")?;
            }
            "--rid" => {
                i += 1;
                base_room_id = parse_count(argv, i, "--rid")?;
            }
            other => anyhow::bail!("unknown conference argument: {other}"),
        }
        i += 1;
    }

    Ok(Command::Conference {
        room_count,
        user_per_room,
        base_room_id,
    })
}

fn parse_count(argv: &[String], i: usize, flag: &str) -> anyhow::Result<usize> {
    argv.get(i)
        .with_context(|| format!("missing {flag} value"))?
        .parse()
        .with_context(|| format!("invalid {flag} value"))
}
