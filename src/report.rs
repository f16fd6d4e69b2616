//! Summary lines printed after each round iteration.

use std::fmt::Write;

use crate::stats::{Spread, Totals};

/// One summary line for the counter deltas `d` gathered over `nsec`.
///
/// Ratios over empty denominators come out as `NaN`, like any other
/// division by zero; a quiet interval is visible as such in the output.
pub fn summary(d: &Totals, load: f64, nsec: f64, spread: &Spread) -> String {
    let secs = nsec / 1.0e9;
    let sent = d.sent() as f64;
    let replied = d.replied() as f64;

    let mut line = String::with_capacity(320);
    let _ = write!(
        line,
        "qos {:.3} load {:.0} send_rate {:.0} reply_rate {:.0} avg_lat {:.3}ms \
         avg_sdelay {:.1}us avg_sdura {:.1}us hit_ratio {:.3} get_ratio {:.3} \
         set_ratio {:.3} udp_timeout {:.0}",
        d.good_qos as f64 / d.retired() as f64 * 100.0,
        load,
        sent / secs,
        replied / secs,
        d.latency_sum / replied,
        d.send_delay_sum / sent,
        d.send_duration_sum / sent,
        d.hit_get as f64 / d.replied_get as f64,
        d.sent_get as f64 / sent,
        d.sent_set as f64 / sent,
        d.udp_timeout as f64,
    );
    let _ = write!(
        line,
        " os_sum {} os_max {} os_min {} os_avg {:.0} max_lat {:.3}ms min_lat {:.3}ms",
        spread.os_sum,
        spread.os_max,
        spread.os_min,
        spread.os_avg,
        spread.max_latency,
        spread.min_latency,
    );
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_every_column() {
        let d = Totals {
            sent_set: 100,
            sent_get: 300,
            replied_set: 100,
            replied_get: 290,
            hit_get: 145,
            good_qos: 380,
            latency_sum: 97.5,
            send_delay_sum: 800.0,
            send_duration_sum: 1200.0,
            udp_timeout: 10,
        };
        let spread = Spread {
            os_sum: 12,
            os_max: 5,
            os_min: 1,
            os_avg: 3.0,
            max_latency: 1.2344,
            min_latency: 0.0501,
        };
        assert_eq!(
            summary(&d, 400.0, 2.0e9, &spread),
            "qos 95.000 load 400 send_rate 200 reply_rate 195 avg_lat 0.250ms \
             avg_sdelay 2.0us avg_sdura 3.0us hit_ratio 0.500 get_ratio 0.750 \
             set_ratio 0.250 udp_timeout 10 os_sum 12 os_max 5 os_min 1 os_avg 3 \
             max_lat 1.234ms min_lat 0.050ms"
        );
    }

    #[test]
    fn quiet_interval_prints_nan() {
        let line = summary(&Totals::default(), 10.0, 1.0e9, &Spread::of(&[]));
        assert!(line.starts_with("qos NaN load 10 send_rate 0 reply_rate 0 avg_lat NaNms"));
    }
}
