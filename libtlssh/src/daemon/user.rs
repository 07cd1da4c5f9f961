// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{ffi::CString, io, ptr};

use anyhow::anyhow;

/// The slice of the passwd record the session server needs.
#[derive(Debug, Clone)]
pub struct Passwd {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub home_dir: String,
    pub shell: String,
}

/// Resolve an authenticated username against the system password
/// database. Unknown users are fatal; there is nobody to run the shell
/// as.
pub fn by_name(name: &str) -> anyhow::Result<Passwd> {
    let c_name = CString::new(name).map_err(|_| anyhow!("NUL in username"))?;

    let mut passwd_str_buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    let mut passwd = libc::passwd {
        pw_name: ptr::null_mut(),
        pw_passwd: ptr::null_mut(),
        pw_uid: 0,
        pw_gid: 0,
        pw_gecos: ptr::null_mut(),
        pw_dir: ptr::null_mut(),
        pw_shell: ptr::null_mut(),
    };
    let mut passwd_res_ptr: *mut libc::passwd = ptr::null_mut();
    unsafe {
        // Safety: pretty much pure ffi, passwd and passwd_str_buf correctly
        //         have memory backing them.
        let errno = libc::getpwnam_r(
            c_name.as_ptr(),
            &mut passwd,
            passwd_str_buf.as_mut_ptr(),
            passwd_str_buf.len(),
            &mut passwd_res_ptr as *mut *mut libc::passwd,
        );
        if passwd_res_ptr.is_null() {
            if errno == 0 {
                // deliberately echoes only the name; it cannot be a
                // leaked password because there are no passwords
                return Err(anyhow!("no such user '{}'", name));
            } else {
                return Err(anyhow!(
                    "error resolving user '{}': {}",
                    name,
                    io::Error::from_raw_os_error(errno)
                ));
            }
        }

        // Safety: these pointers are all cstrings backed by passwd_str_buf
        Ok(Passwd {
            name: String::from(String::from_utf8_lossy(
                std::ffi::CStr::from_ptr(passwd.pw_name).to_bytes(),
            )),
            uid: passwd.pw_uid,
            gid: passwd.pw_gid,
            home_dir: String::from(String::from_utf8_lossy(
                std::ffi::CStr::from_ptr(passwd.pw_dir).to_bytes(),
            )),
            shell: String::from(String::from_utf8_lossy(
                std::ffi::CStr::from_ptr(passwd.pw_shell).to_bytes(),
            )),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_resolves() {
        let pw = by_name("root").expect("root must exist");
        assert_eq!(pw.name, "root");
        assert_eq!(pw.uid, 0);
        assert!(!pw.shell.is_empty());
    }

    #[test]
    fn unknown_user_is_an_error() {
        assert!(by_name("no-such-user-tlssh").is_err());
    }
}
