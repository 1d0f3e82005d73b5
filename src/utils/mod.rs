use std::fmt::Display;
use std::io;
use std::num::ParseIntError;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Relaxed)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Relaxed)
}

/// Watch the termination signals on a background thread. The first one
/// received runs `on_signal` and raises the stop flag.
pub fn setup_signal_handler<F>(on_signal: F) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;

    fn named_signal(sig: c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    let mut signals = SignalsInfo::<WithOrigin>::new(TERM_SIGNALS)?;
    std::thread::spawn(move || {
        if let Some(info) = signals.into_iter().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, cause: {:?}",
                named_signal(info.signal),
                from,
                info.cause
            );
            stop_req();
            on_signal();
        }
    });
    Ok(())
}

/// Log `err` and terminate the whole process.
///
/// Used for configuration errors and handoff protocol violations, after which
/// no partial operation is safe.
pub fn fatal<E: Display>(what: &str, err: E) -> ! {
    log::error!("{}: {}", what, err);
    std::process::exit(1)
}

/// Parse a hex number, with or without the `0x` prefix.
pub fn parse_hex_u64(s: &str) -> Result<u64, ParseIntError> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(digits, 16)
}

pub(crate) fn hex_string(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parse() {
        assert_eq!(parse_hex_u64("0x490000"), Ok(0x490000));
        assert_eq!(parse_hex_u64("C5000000"), Ok(0xc500_0000));
        assert_eq!(parse_hex_u64(" 0X10 "), Ok(0x10));
        assert!(parse_hex_u64("zz").is_err());
    }

    #[test]
    fn hex_dump() {
        assert_eq!(hex_string(&[0x00, 0xab, 0x7f]), "00ab7f");
        assert_eq!(hex_string(&[]), "");
    }
}
