//! Parsing of the `TRANSFORM_SINK` value the binary writes to.

use std::path::PathBuf;
use std::str::FromStr;

use transform_writer::Error;

/// Where the binary writes, e.g. `json:out.json`, `es:post20170630/news`, `redis:queue:HASH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Json(PathBuf),
    Txt(PathBuf),
    Es { index: String, doc_type: String },
    Redis { key: String, key_type: String },
    MySql { table: String },
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("sink {s:?} must look like <kind>:<target>")))?;
        if rest.is_empty() {
            return Err(Error::Config(format!("sink {s:?} has no target")));
        }

        match kind {
            "json" => Ok(Target::Json(PathBuf::from(rest))),
            "txt" => Ok(Target::Txt(PathBuf::from(rest))),
            "es" => {
                let (index, doc_type) = rest
                    .split_once('/')
                    .filter(|(i, d)| !i.is_empty() && !d.is_empty())
                    .ok_or_else(|| {
                        Error::Config(format!("es sink {rest:?} must look like <index>/<doc_type>"))
                    })?;
                Ok(Target::Es {
                    index: index.to_string(),
                    doc_type: doc_type.to_string(),
                })
            }
            "redis" => {
                let (key, key_type) = match rest.rsplit_once(':') {
                    Some((key, key_type @ ("LIST" | "HASH"))) => (key, key_type),
                    _ => (rest, "LIST"),
                };
                Ok(Target::Redis {
                    key: key.to_string(),
                    key_type: key_type.to_string(),
                })
            }
            "mysql" => Ok(Target::MySql {
                table: rest.to_string(),
            }),
            other => Err(Error::Config(format!(
                "unknown sink kind {other:?}, expected one of json, txt, es, redis, mysql"
            ))),
        }
    }
}
