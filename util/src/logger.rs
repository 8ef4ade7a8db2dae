// Copyright (c) 2025 LazyMig Authors. All rights reserved.
//
// LazyMig is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use std::io::prelude::*;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::unix::gettid;

fn format_now() -> String {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // SAFETY: Both structs are local and fully initialized by the libc calls.
    let mut ti: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        libc::localtime_r(&ts.tv_sec, &mut ti);
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
        ti.tm_year + 1900,
        ti.tm_mon + 1,
        ti.tm_mday,
        ti.tm_hour,
        ti.tm_min,
        ti.tm_sec,
        ts.tv_nsec
    )
}

/// Format like "%year-%mon-%dayT%hour:%min:%sec.%nsec"
struct VmLogger {
    handler: Mutex<Box<dyn Write + Send>>,
    level: Level,
}

impl Log for VmLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // SAFETY: getpid never fails.
            let pid = unsafe { libc::getpid() };
            let tid = gettid();

            let _ = self.handler.lock().unwrap().write_fmt(format_args!(
                "{:<5}: [{}][{}][{}: {}]:{}: {}\n",
                format_now(),
                pid,
                tid,
                record.file().unwrap_or(""),
                record.line().unwrap_or(0),
                record.level(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Init a logger whose level is read from the `LAZYMIG_LOG_LEVEL` environment
/// variable, defaulting to `info`. Logs go to `logfile`, or stderr when none
/// is given.
pub fn init_logger_with_env(logfile: Option<Box<dyn Write + Send>>) -> Result<(), SetLoggerError> {
    let level = match std::env::var("LAZYMIG_LOG_LEVEL") {
        Ok(l) => match l.to_lowercase().as_str() {
            "error" => Level::Error,
            "warn" => Level::Warn,
            "info" => Level::Info,
            "debug" => Level::Debug,
            "trace" => Level::Trace,
            _ => Level::Info,
        },
        _ => Level::Info,
    };

    let logger = VmLogger {
        level,
        handler: Mutex::new(logfile.unwrap_or_else(|| Box::new(std::io::stderr()))),
    };

    log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(LevelFilter::Trace))
}
