//! Host uptime, one implementation per target OS. Failure is reported as a
//! zero duration rather than an error.

use std::time::Duration;

#[cfg(target_os = "linux")]
pub fn system_uptime() -> Duration {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sysinfo(&mut info) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::from_secs(info.uptime.max(0) as u64)
}

#[cfg(target_os = "macos")]
pub fn system_uptime() -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};

    // kern.boottime prints as `{ sec = 1700000000, usec = 0 } ...`.
    let out = match std::process::Command::new("sysctl")
        .args(["-n", "kern.boottime"])
        .output()
    {
        Ok(out) => out,
        Err(_) => return Duration::ZERO,
    };
    let text = String::from_utf8_lossy(&out.stdout);
    let Some(idx) = text.find("sec = ") else {
        return Duration::ZERO;
    };
    let rest = &text[idx + 6..];
    let end = rest.find(',').unwrap_or(rest.len());
    let Ok(boot) = rest[..end].trim().parse::<i64>() else {
        return Duration::ZERO;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    if now > boot {
        Duration::from_secs((now - boot) as u64)
    } else {
        Duration::ZERO
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn system_uptime() -> Duration {
    Duration::ZERO
}
