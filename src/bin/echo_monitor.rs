//! Pass-through port monitor used as the target in tests.
//!
//! Follows the CUPS backend contract: `uri job-id user title copies options
//! [file]`. The job (stdin, or the named file) is written to stdout
//! `copies` times. Status goes to stderr as `DEBUG:` / `ERROR:` lines.
//!
//! Space separated options in argv[5]:
//!
//! - `exit-status=N`: exit with N after streaming
//! - `signal=N`: kill itself with signal N after streaming
//! - `preamble=N`: write N `#` bytes to stdout before reading any input
//! - `check-fds`: exit 3 if any descriptor above 3 is open

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::process;

const SIDE_CHANNEL_FD: i32 = 3;

#[derive(Debug, Default)]
struct Options {
    exit_status: Option<i32>,
    signal: Option<i32>,
    preamble: usize,
    check_fds: bool,
}

impl Options {
    fn parse(raw: &str) -> Result<Self, String> {
        let mut options = Options::default();
        for word in raw.split_whitespace() {
            match word.split_once('=') {
                Some(("exit-status", n)) => options.exit_status = Some(number(word, n)?),
                Some(("signal", n)) => options.signal = Some(number(word, n)?),
                Some(("preamble", n)) => options.preamble = number(word, n)?,
                None if word == "check-fds" => options.check_fds = true,
                _ => return Err(format!("unknown option {word}")),
            }
        }
        Ok(options)
    }
}

fn number<T: std::str::FromStr>(word: &str, value: &str) -> Result<T, String> {
    value.parse().map_err(|_| format!("bad value in {word}"))
}

fn is_open(fd: i32) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

fn stray_fd() -> Option<i32> {
    (SIDE_CHANNEL_FD + 1..1024).find(|&fd| is_open(fd))
}

fn read_job(file: Option<&OsString>) -> io::Result<Vec<u8>> {
    let mut job = Vec::new();
    match file {
        Some(path) => {
            File::open(path)?.read_to_end(&mut job)?;
        }
        None => {
            io::stdin().lock().read_to_end(&mut job)?;
        }
    }
    Ok(job)
}

fn run(args: &[OsString]) -> i32 {
    if args.len() < 6 || args.len() > 7 {
        eprintln!("Usage: echo-monitor job-id user title copies options [file]");
        return 1;
    }

    // descriptors first, before this process opens anything of its own
    let stray = stray_fd();
    let side_channel_open = is_open(SIDE_CHANNEL_FD);

    let copies: u32 = match args[4].to_string_lossy().parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("ERROR: invalid copy count {:?}", args[4]);
            return 1;
        }
    };
    let options = match Options::parse(&args[5].to_string_lossy()) {
        Ok(options) => options,
        Err(reason) => {
            eprintln!("ERROR: {reason}");
            return 1;
        }
    };

    eprintln!("DEBUG: echo monitor running, {copies} copies");
    if side_channel_open {
        eprintln!("DEBUG: side-channel open on fd {SIDE_CHANNEL_FD}");
    } else {
        eprintln!("ERROR: side-channel fd {SIDE_CHANNEL_FD} is not open");
        return 4;
    }
    if options.check_fds {
        if let Some(fd) = stray {
            eprintln!("ERROR: unexpected descriptor {fd} is open");
            return 3;
        }
    }

    let mut stdout = io::stdout().lock();
    if options.preamble > 0 {
        if let Err(e) = stdout.write_all(&vec![b'#'; options.preamble]).and_then(|_| stdout.flush()) {
            eprintln!("ERROR: unable to write preamble: {e}");
            return 1;
        }
    }

    let job = match read_job(args.get(6)) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("ERROR: unable to read print data: {e}");
            return 1;
        }
    };

    for _ in 0..copies {
        if let Err(e) = stdout.write_all(&job) {
            eprintln!("ERROR: unable to write print data: {e}");
            return 1;
        }
    }
    if let Err(e) = stdout.flush() {
        eprintln!("ERROR: unable to write print data: {e}");
        return 1;
    }
    eprintln!("DEBUG: sent {} bytes", job.len() * copies as usize);

    if let Some(sig) = options.signal {
        unsafe {
            libc::kill(libc::getpid(), sig);
        }
    }
    options.exit_status.unwrap_or(0)
}

fn main() {
    let args: Vec<OsString> = std::env::args_os().collect();
    process::exit(run(&args));
}
