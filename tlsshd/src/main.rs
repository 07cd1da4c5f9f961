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

use clap::Parser;

fn main() {
    let args = match libtlssh::daemon::Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let is_usage_error = err.use_stderr();
            let _ = err.print();
            std::process::exit(if is_usage_error { 1 } else { 0 });
        }
    };

    if let Err(err) = libtlssh::init_logging(args.verbose, args.log_file.as_deref(), true) {
        eprintln!("tlsshd: {err:#}");
        std::process::exit(1);
    }

    if let Err(err) = libtlssh::daemon::run(args) {
        eprintln!("tlsshd: {err:#}");
        std::process::exit(1);
    }
}
