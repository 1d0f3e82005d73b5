//! Loader of the line-oriented descriptor format:
//!
//! ```text
//! BasicBlock: <anything>
//! 0,3254779904,u32
//! 1,,paddr_t
//! 2,,size_t
//! BasicBlock: <anything>
//! ...
//! ```
//!
//! Lines before the first marker are ignored. A group ends at the next marker
//! or at end of file, missing slots are padded with `donotfill`.

use super::{ArgDesc, ArgKind, DescriptorError, OptionRow, GROUP_MARKER, MAX_OPTIONS};
use crate::access::NUM_ARG_REGS;

pub fn parse_descriptor(content: &str) -> Result<Vec<OptionRow>, DescriptorError> {
    let mut rows = Vec::new();
    let mut group = Vec::with_capacity(NUM_ARG_REGS);
    let mut started = false;

    for (n, line) in content.lines().enumerate() {
        if line.contains(GROUP_MARKER) {
            if started {
                flush_group(&mut rows, &mut group)?;
            }
            started = true;
            continue;
        }
        if !started || group.len() == NUM_ARG_REGS {
            continue;
        }
        if let Some(arg) = parse_arg(line, group.len(), n + 1)? {
            log::trace!(
                "option {} x{}: const {:?}, kind {}",
                rows.len(),
                arg.slot,
                arg.constant,
                arg.kind
            );
            group.push(arg);
        }
    }
    if started {
        flush_group(&mut rows, &mut group)?;
    }
    Ok(rows)
}

fn flush_group(rows: &mut Vec<OptionRow>, group: &mut Vec<ArgDesc>) -> Result<(), DescriptorError> {
    if group.is_empty() {
        return Ok(());
    }
    if rows.len() == MAX_OPTIONS {
        return Err(DescriptorError::TooManyOptions);
    }
    let mut row = [ArgDesc::skip(0); NUM_ARG_REGS];
    for (i, r) in row.iter_mut().enumerate() {
        *r = group.get(i).copied().unwrap_or_else(|| ArgDesc::skip(i));
    }
    rows.push(row);
    group.clear();
    Ok(())
}

/// Parse `index, constant-or-blank, type-tag`. Rows that are not for the
/// next expected slot are dropped.
fn parse_arg(line: &str, expected: usize, line_no: usize) -> Result<Option<ArgDesc>, DescriptorError> {
    let mut fields = line.splitn(3, ',').map(str::trim);
    let slot = match fields.next().and_then(|f| f.parse::<usize>().ok()) {
        Some(s) => s,
        None => return Ok(None),
    };
    if slot != expected {
        return Ok(None);
    }

    let constant = match fields.next() {
        Some(c) if !c.is_empty() => Some(parse_constant(c).ok_or_else(|| {
            DescriptorError::BadConstant {
                line: line_no,
                value: c.to_string(),
            }
        })?),
        _ => None,
    };
    let tag = fields.next().unwrap_or("");
    let kind = if constant.is_some() && tag.is_empty() {
        ArgKind::default_for(slot)
    } else {
        ArgKind::from_tag(tag, slot)
    };

    Ok(Some(ArgDesc {
        slot,
        constant,
        kind,
    }))
}

fn parse_constant(c: &str) -> Option<u64> {
    if let Some(hex) = c.strip_prefix("0x").or_else(|| c.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        c.parse::<u64>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC: &str = "\
header line from the analysis
0,1,ignored
BasicBlock: %12 in smc_handler
0,3254779904,u32
1,,paddr_t
2,,size_t
BasicBlock: %40 in smc_handler
0,0xc2000001,
1,,uint64_t
3,,ignored because out of order
BasicBlock: %41 in smc_handler
BasicBlock: %44 in smc_handler
0,,u32
1,100,
2,,donotfill
";

    #[test]
    fn parse_groups() {
        let rows = parse_descriptor(DESC).unwrap();
        assert_eq!(rows.len(), 3);

        let r = &rows[0];
        assert_eq!(r[0].constant, Some(3254779904));
        assert_eq!(r[1].kind, ArgKind::MemoryRef);
        assert_eq!(r[2].kind, ArgKind::SizeValue);
        assert!(r[3..].iter().all(|a| a.kind == ArgKind::Skip));
        assert_eq!(r[5].slot, 5);

        let r = &rows[1];
        assert_eq!(r[0].constant, Some(0xc200_0001));
        assert_eq!(r[1].kind, ArgKind::Scalar64);
        assert_eq!(r[2].kind, ArgKind::Skip);

        let r = &rows[2];
        assert_eq!(r[0].constant, None);
        assert_eq!(r[0].kind, ArgKind::Scalar32);
        assert_eq!(r[1].constant, Some(100));
        assert_eq!(r[2].kind, ArgKind::Skip);
    }

    #[test]
    fn group_capped_at_eight() {
        let mut s = String::from("BasicBlock\n");
        for i in 0..10 {
            s.push_str(&format!("{},,u32\n", i));
        }
        let rows = parse_descriptor(&s).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].iter().all(|a| a.kind == ArgKind::Scalar32));
        assert_eq!(rows[0][7].slot, 7);
    }

    #[test]
    fn bad_constant() {
        let err = parse_descriptor("BasicBlock\n0,12q,u32\n").unwrap_err();
        assert!(matches!(err, DescriptorError::BadConstant { line: 2, .. }));
    }

    #[test]
    fn no_marker_no_rows() {
        assert!(parse_descriptor("0,,u32\n1,,u64\n").unwrap().is_empty());
    }

    #[test]
    fn too_many_options() {
        let mut s = String::new();
        for _ in 0..=MAX_OPTIONS {
            s.push_str("BasicBlock\n0,,u32\n");
        }
        assert!(matches!(
            parse_descriptor(&s),
            Err(DescriptorError::TooManyOptions)
        ));
    }
}
