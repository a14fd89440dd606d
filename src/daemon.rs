//! Privilege drop and fork to background.

use std::{ffi::CString, io};

use crate::error::Error;

pub struct Credentials {
    uid: libc::uid_t,
    gid: libc::gid_t,
}

impl Credentials {
    /// Resolves user and group names. Root is refused as a drop target.
    pub fn lookup(user: &str, group: &str) -> Result<Self, Error> {
        Ok(Self {
            uid: lookup_uid(user)?,
            gid: lookup_gid(group)?,
        })
    }

    /// Group first: after setuid the process may no longer change groups.
    pub fn drop_privileges(&self) -> Result<(), Error> {
        if unsafe { libc::setgid(self.gid) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        if unsafe { libc::setuid(self.uid) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

fn lookup_uid(user: &str) -> Result<libc::uid_t, Error> {
    let name =
        CString::new(user).map_err(|_| Error::Credentials(format!("invalid user name: {user}")))?;

    // getpwnam's static result is fine here: called once at startup before
    // the runtime exists.
    let pw = unsafe { libc::getpwnam(name.as_ptr()) };
    if pw.is_null() {
        return Err(Error::Credentials(format!("unknown user: {user}")));
    }

    let uid = unsafe { (*pw).pw_uid };
    if uid == 0 {
        return Err(Error::Credentials(format!(
            "refusing to keep uid 0, pick an unprivileged user instead of {user}"
        )));
    }

    Ok(uid)
}

fn lookup_gid(group: &str) -> Result<libc::gid_t, Error> {
    let name = CString::new(group)
        .map_err(|_| Error::Credentials(format!("invalid group name: {group}")))?;

    let gr = unsafe { libc::getgrnam(name.as_ptr()) };
    if gr.is_null() {
        return Err(Error::Credentials(format!("unknown group: {group}")));
    }

    let gid = unsafe { (*gr).gr_gid };
    if gid == 0 {
        return Err(Error::Credentials(format!(
            "refusing to keep gid 0, pick an unprivileged group instead of {group}"
        )));
    }

    Ok(gid)
}

/// Forks to background, starts a new session and points stdio at /dev/null.
/// Must run before the async runtime is built.
pub fn daemonize() -> Result<(), Error> {
    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error().into()),
        0 => {}
        _ => unsafe { libc::_exit(0) },
    }

    if unsafe { libc::setsid() } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    unsafe {
        libc::chdir(b"/\0".as_ptr() as *const libc::c_char);

        let devnull = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            libc::dup2(devnull, libc::STDOUT_FILENO);
            libc::dup2(devnull, libc::STDERR_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_refused() {
        assert!(matches!(
            Credentials::lookup("root", "root"),
            Err(Error::Credentials(_))
        ));
    }

    #[test]
    fn unknown_user_is_refused() {
        assert!(matches!(
            Credentials::lookup("no-such-user-here", "no-such-group-here"),
            Err(Error::Credentials(_))
        ));
    }
}
