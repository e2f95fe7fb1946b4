use crate::{
    accel::{BuildSettings, SplitMethod},
    error::{Error, Result},
    primitives::DegeneratePolicy,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Accept hits at exactly `tmin`
    pub inclusive_tmin: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineSettings {
    pub build: BuildSettings,
    pub query: QueryOptions,
    pub degenerate_policy: DegeneratePolicy,
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| Error::invalid_option(name, value))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(Error::invalid_option(name, value)),
    }
}

impl EngineSettings {
    /// Option names accepted by `set_option`
    pub const OPTIONS: [&'static str; 7] = [
        "bvh.builder",
        "bvh.sah.num_bins",
        "bvh.sah.traversal_cost",
        "bvh.leaf_size",
        "bvh.max_depth",
        "geometry.degenerate",
        "query.inclusive_tmin",
    ];

    /// Sets a named option from its string form. Settings are left unchanged on error.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let invalid = || Error::invalid_option(name, value);
        match name {
            "bvh.builder" => {
                self.build.split_method = match value.trim() {
                    "sah" => SplitMethod::Sah,
                    "median" => SplitMethod::Median,
                    _ => return Err(invalid()),
                }
            }
            "bvh.sah.num_bins" => {
                let bins: usize = parse(name, value)?;
                if bins < 2 {
                    return Err(invalid());
                }
                self.build.bin_count = bins;
            }
            "bvh.sah.traversal_cost" => {
                let cost: f32 = parse(name, value)?;
                if !(cost.is_finite() && cost >= 0.0) {
                    return Err(invalid());
                }
                self.build.traversal_cost = cost;
            }
            "bvh.leaf_size" => {
                let size: usize = parse(name, value)?;
                if size == 0 {
                    return Err(invalid());
                }
                self.build.max_leaf_size = size;
            }
            "bvh.max_depth" => {
                let depth: usize = parse(name, value)?;
                if depth == 0 {
                    return Err(invalid());
                }
                self.build.max_depth = depth;
            }
            "geometry.degenerate" => {
                self.degenerate_policy = match value.trim() {
                    "keep" => DegeneratePolicy::Keep,
                    "reject" => DegeneratePolicy::Reject,
                    _ => return Err(invalid()),
                }
            }
            "query.inclusive_tmin" => self.query.inclusive_tmin = parse_bool(name, value)?,
            _ => return Err(invalid()),
        }
        Ok(())
    }

    /// Parses `key=value` and applies it
    pub fn apply(&mut self, assignment: &str) -> Result<()> {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| Error::invalid_option(assignment, ""))?;
        self.set_option(name.trim(), value)
    }
}
