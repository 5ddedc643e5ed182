//! nacl-loader: reference loader launched by the process host.
//!
//! Finds its control channel at descriptor 3, receives the start message,
//! checks the runtime image against the host's validation cache and then
//! echoes bytes on every data socket. Exits once the requester has closed
//! all data sockets, or as soon as the host closes the control channel.

// Loader is a standalone child binary; stderr is the correct error channel.
#![allow(clippy::print_stderr)]

#[cfg(not(unix))]
fn main() {
    eprintln!("[nacl-loader] only supported on Unix");
    std::process::exit(1);
}

#[cfg(unix)]
fn main() {
    use nacl_proto::switches;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let type_switch = format!("--{}={}", switches::PROCESS_TYPE, switches::LOADER_PROCESS);
    if !args.iter().any(|a| *a == type_switch) {
        eprintln!("[nacl-loader] usage: nacl-loader {type_switch} --channel=<id>");
        std::process::exit(2);
    }
    let channel_prefix = format!("--{}=", switches::CHANNEL_ID);
    let channel = args
        .iter()
        .find_map(|a| a.strip_prefix(channel_prefix.as_str()))
        .unwrap_or("?")
        .to_owned();

    if let Err(e) = run(&channel) {
        eprintln!("[nacl-loader] channel {channel}: {e}");
        std::process::exit(1);
    }
}

/// Runs the loader side of the protocol on the inherited control channel.
#[cfg(unix)]
#[allow(unsafe_code)]
fn run(channel: &str) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use nacl_host::client::{self, LoaderChannel};

    // SAFETY: called once, in a process the host launched with descriptor 3
    // set to the control channel.
    let mut control = unsafe { LoaderChannel::from_control_fd() }?;
    let start = control.recv_start()?;
    eprintln!(
        "[nacl-loader] channel {channel}: started by {} with {} socket(s)",
        start.params.version,
        start.sockets.len()
    );

    let signature = client::file_signature(&start.params.validation_cache_key, &start.image)?;
    if control.query_known_to_validate(&signature)? {
        eprintln!("[nacl-loader] runtime image known to validate");
    } else if start.image.metadata()?.len() > 0 {
        control.set_known_to_validate(&signature)?;
    } else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "runtime image failed validation",
        ));
    }

    std::thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            let _ = control.wait_for_close();
            std::process::exit(0);
        })?;

    let mut echoes = Vec::with_capacity(start.sockets.len());
    for (i, fd) in start.sockets.into_iter().enumerate() {
        let mut sock = UnixStream::from(fd);
        echoes.push(std::thread::Builder::new().name(format!("echo-{i}")).spawn(
            move || -> std::io::Result<()> {
                let mut buf = [0u8; 4096];
                loop {
                    let n = sock.read(&mut buf)?;
                    if n == 0 {
                        return Ok(());
                    }
                    sock.write_all(&buf[..n])?;
                }
            },
        )?);
    }
    for echo in echoes {
        match echo.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => eprintln!("[nacl-loader] echo failed: {e}"),
            Err(_) => eprintln!("[nacl-loader] echo thread panicked"),
        }
    }
    Ok(())
}
