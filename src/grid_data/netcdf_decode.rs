//! Decodes ERA5 monthly-means NetCDF downloads into a [`PrecipGrid`].

use crate::grid_data::error::ValidationError;
use crate::types::grid::{PrecipGrid, PRECIP_VARIABLE};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use std::path::Path;

const LAT_NAMES: &[&str] = &["latitude", "lat"];
const LON_NAMES: &[&str] = &["longitude", "lon"];
const TIME_NAMES: &[&str] = &["valid_time", "time"];

fn has_attr(var: &netcdf::Variable, name: &str) -> bool {
    var.attributes().any(|attr| attr.name() == name)
}

fn get_f64_attr(var: &netcdf::Variable, name: &str) -> Option<f64> {
    if !has_attr(var, name) {
        return None;
    }
    let attr_value = var.attribute_value(name)?.ok()?;
    f64::try_from(attr_value).ok()
}

fn get_str_attr(var: &netcdf::Variable, name: &str) -> Option<String> {
    if !has_attr(var, name) {
        return None;
    }
    match var.attribute_value(name)?.ok()? {
        netcdf::AttributeValue::Str(s) => Some(s),
        _ => None,
    }
}

fn decode_error(context: &str, e: impl std::fmt::Display) -> ValidationError {
    ValidationError::Decode(format!("{}: {}", context, e))
}

fn find_variable<'f>(
    file: &'f netcdf::File,
    names: &[&str],
) -> Result<netcdf::Variable<'f>, ValidationError> {
    names
        .iter()
        .find_map(|name| file.variable(name))
        .ok_or_else(|| ValidationError::MissingVariable(names[0].to_string()))
}

/// Values of `var` with `scale_factor`/`add_offset` applied and fill values as NaN.
fn unpacked_values(var: &netcdf::Variable) -> Result<Vec<f64>, ValidationError> {
    let raw: Vec<f64> = var
        .get_values(..)
        .map_err(|e| decode_error(&format!("reading '{}'", var.name()), e))?;
    let scale = get_f64_attr(var, "scale_factor").unwrap_or(1.0);
    let offset = get_f64_attr(var, "add_offset").unwrap_or(0.0);
    let fill = get_f64_attr(var, "_FillValue").or_else(|| get_f64_attr(var, "missing_value"));
    Ok(raw
        .into_iter()
        .map(|v| match fill {
            Some(f) if v == f => f64::NAN,
            _ => v * scale + offset,
        })
        .collect())
}

/// Parses CF time units such as `seconds since 1970-01-01` or
/// `hours since 1900-01-01 00:00:00.0` into (seconds per unit, epoch).
pub(crate) fn parse_time_units(units: &str) -> Option<(i64, NaiveDateTime)> {
    let (unit, epoch) = units.split_once(" since ")?;
    let seconds = match unit.trim() {
        "seconds" | "second" | "s" => 1,
        "minutes" | "minute" => 60,
        "hours" | "hour" | "h" => 3600,
        "days" | "day" | "d" => 86_400,
        _ => return None,
    };
    let epoch = epoch.trim();
    let date = NaiveDate::parse_from_str(epoch.get(..10)?, "%Y-%m-%d").ok()?;
    // Optional time of day after a space or `T`; a trailing zone is ignored.
    let time_text = epoch
        .get(10..)?
        .trim_start_matches(['T', ' '])
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('Z');
    let time = if time_text.is_empty() {
        NaiveTime::MIN
    } else {
        NaiveTime::parse_from_str(time_text, "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(time_text, "%H:%M"))
            .ok()?
    };
    Some((seconds, date.and_time(time)))
}

fn month_of(offset: f64, seconds_per_unit: i64, epoch: NaiveDateTime) -> Option<u32> {
    let seconds = (offset * seconds_per_unit as f64).round() as i64;
    let at = epoch.checked_add_signed(TimeDelta::try_seconds(seconds)?)?;
    Some(at.month())
}

pub(crate) fn decode_netcdf(path: &Path) -> Result<PrecipGrid, ValidationError> {
    let file = netcdf::open(path).map_err(|e| decode_error("opening NetCDF", e))?;

    let tp = file
        .variable(PRECIP_VARIABLE)
        .ok_or_else(|| ValidationError::MissingVariable(PRECIP_VARIABLE.to_string()))?;
    let dims: Vec<String> = tp.dimensions().iter().map(|d| d.name()).collect();
    if dims.len() != 3 {
        return Err(ValidationError::Decode(format!(
            "'{}' has dimensions {:?}, expected (time, latitude, longitude)",
            PRECIP_VARIABLE, dims
        )));
    }

    let latitudes = unpacked_values(&find_variable(&file, LAT_NAMES)?)?;
    let longitudes = unpacked_values(&find_variable(&file, LON_NAMES)?)?;
    let time = find_variable(&file, TIME_NAMES)?;
    let units = get_str_attr(&time, "units")
        .ok_or_else(|| ValidationError::Decode("time axis has no units".to_string()))?;
    let (seconds_per_unit, epoch) = parse_time_units(&units)
        .ok_or_else(|| ValidationError::Decode(format!("unsupported time units '{}'", units)))?;
    let months = unpacked_values(&time)?
        .into_iter()
        .map(|offset| month_of(offset, seconds_per_unit, epoch))
        .collect::<Option<Vec<u32>>>()
        .ok_or_else(|| ValidationError::Decode("time value out of range".to_string()))?;

    let values = unpacked_values(&tp)?
        .into_iter()
        .map(|v| v as f32)
        .collect();

    Ok(PrecipGrid {
        variable: PRECIP_VARIABLE.to_string(),
        units: get_str_attr(&tp, "units"),
        latitudes,
        longitudes,
        months,
        values,
    })
}
