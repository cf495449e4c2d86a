// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use super::FrontendError;

/// Options parsed from a front-end option string. The string is
/// whitespace-tokenized; keys may appear as `--key value`, `key value` or
/// `key=value`.
#[derive(Clone, Debug, PartialEq)]
pub struct TunerArgs {
    /// Device address arguments handed through to the driver.
    pub device_args: String,
    /// Daughterboard antenna selection.
    pub antenna: Option<String>,
    /// Requested input sample rate in samples per second.
    pub rate: Option<f64>,
    /// Daughterboard subdevice specification.
    pub subdevice: Option<String>,
    /// IF filter bandwidth in Hz.
    pub bandwidth: Option<f64>,
    /// Clock reference source.
    pub clock_ref: String,
    /// Time source.
    pub time_source: String,
}

impl Default for TunerArgs {
    fn default() -> Self {
        TunerArgs {
            device_args: String::new(),
            antenna: None,
            rate: None,
            subdevice: None,
            bandwidth: None,
            clock_ref: "internal".to_string(),
            time_source: "external".to_string(),
        }
    }
}

impl TunerArgs {
    /// Parses an option string. Unknown keys, missing values and malformed
    /// numbers fail with [FrontendError::ParametersWrong].
    pub fn parse(options: &str) -> Result<TunerArgs, FrontendError> {
        let mut args = TunerArgs::default();

        let mut tokens = options.split_whitespace();
        while let Some(token) = tokens.next() {
            let key = token.trim_start_matches("--");
            let (key, value) = match key.split_once('=') {
                Some((key, value)) => (key, value.to_string()),
                None => {
                    let value = tokens.next().ok_or_else(|| {
                        FrontendError::ParametersWrong(format!("option {} has no value", key))
                    })?;
                    (key, value.to_string())
                }
            };

            match key {
                "args" => args.device_args = value,
                "ant" => args.antenna = Some(value),
                "rate" => args.rate = Some(parse_number(key, &value)?),
                "subdev" => args.subdevice = Some(value),
                "bw" => args.bandwidth = Some(parse_number(key, &value)?),
                "ref" => args.clock_ref = value,
                "tsrc" => args.time_source = value,
                _ => {
                    return Err(FrontendError::ParametersWrong(format!(
                        "unknown option {}",
                        key
                    )))
                }
            }
        }

        Ok(args)
    }
}

fn parse_number(key: &str, value: &str) -> Result<f64, FrontendError> {
    value.parse::<f64>().map_err(|_| {
        FrontendError::ParametersWrong(format!("option {} is not a number: {}", key, value))
    })
}
