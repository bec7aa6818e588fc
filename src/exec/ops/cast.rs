//! Cast kernels. Widening casts preserve values; narrowing integer casts
//! wrap two's-complement; float-to-integer truncates toward zero with
//! saturation at the bounds; NULL positions stay NULL. Varchar sources are
//! parsed, and a malformed element fails the cast at that position.

use chrono::NaiveDate;

use crate::exec::vector::Elem;
use crate::exec::Vector;
use crate::types::{Date, Timestamp, TypeId, VarlenEntry};

use super::{prepare_result, KernelError};

const MICROS_PER_DAY: i64 = 86_400 * 1_000_000;

/// Primitive-to-primitive conversion with `as`-cast semantics.
trait CastPrim<Dst> {
    fn cast_prim(self) -> Dst;
}

macro_rules! impl_cast_prim {
    ($src:ty => $($dst:ty),+) => {
        $(impl CastPrim<$dst> for $src {
            #[inline]
            fn cast_prim(self) -> $dst {
                self as $dst
            }
        })+
    };
}

impl_cast_prim!(i8 => i8, i16, i32, i64, f32, f64);
impl_cast_prim!(i16 => i8, i16, i32, i64, f32, f64);
impl_cast_prim!(i32 => i8, i16, i32, i64, f32, f64);
impl_cast_prim!(i64 => i8, i16, i32, i64, f32, f64);
impl_cast_prim!(f32 => i8, i16, i32, i64, f32, f64);
impl_cast_prim!(f64 => i8, i16, i32, i64, f32, f64);

fn templated_numeric_cast<Src, Dst>(input: &Vector, result: &mut Vector)
where
    Src: Elem + CastPrim<Dst>,
    Dst: Elem,
{
    let values = input.values::<Src>();
    let out = result.values_mut::<Dst>().as_mut_ptr();
    input.for_each_active(|i| unsafe { *out.add(i) = values[i].cast_prim() });
}

/// Values parsed out of varchar elements.
trait ParseElem: Elem {
    fn parse_elem(text: &str) -> Option<Self>;
}

macro_rules! impl_parse_elem {
    ($($ty:ty),+) => {
        $(impl ParseElem for $ty {
            fn parse_elem(text: &str) -> Option<Self> {
                text.trim().parse().ok()
            }
        })+
    };
}

impl_parse_elem!(i8, i16, i32, i64, f32, f64, bool);

impl ParseElem for Date {
    fn parse_elem(text: &str) -> Option<Self> {
        let date = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()?;
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        Some(Date((date - epoch).num_days() as i32))
    }
}

impl ParseElem for Timestamp {
    fn parse_elem(text: &str) -> Option<Self> {
        let ts = chrono::NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
        Some(Timestamp(ts.and_utc().timestamp_micros()))
    }
}

fn templated_parse_cast<Dst: ParseElem>(
    input: &Vector,
    result: &mut Vector,
) -> Result<(), KernelError> {
    let values = input.values::<VarlenEntry>();
    let out = result.values_mut::<Dst>().as_mut_ptr();
    let target = result.type_id();
    let mut failure = None;
    input.for_each_active(|i| {
        if input.null_mask().test(i) || failure.is_some() {
            return;
        }
        let text = String::from_utf8_lossy(values[i].as_bytes());
        match Dst::parse_elem(&text) {
            Some(value) => unsafe { *out.add(i) = value },
            None => failure = Some(i),
        }
    });
    match failure {
        Some(position) => Err(KernelError::CastFailure { position, target }),
        None => Ok(()),
    }
}

macro_rules! dispatch_numeric_src {
    ($src:ty, $dst_type:expr, $input:expr, $result:expr) => {
        match $dst_type {
            TypeId::TinyInt => templated_numeric_cast::<$src, i8>($input, $result),
            TypeId::SmallInt => templated_numeric_cast::<$src, i16>($input, $result),
            TypeId::Integer => templated_numeric_cast::<$src, i32>($input, $result),
            TypeId::BigInt => templated_numeric_cast::<$src, i64>($input, $result),
            TypeId::Float => templated_numeric_cast::<$src, f32>($input, $result),
            TypeId::Double => templated_numeric_cast::<$src, f64>($input, $result),
            other => {
                return Err(KernelError::UnsupportedType {
                    op: "cast",
                    type_id: other,
                })
            }
        }
    };
}

/// Casts `input` into `result`, whose type is the cast target. The result
/// keeps the input's size, filter and null mask.
pub fn cast(input: &Vector, result: &mut Vector) -> Result<(), KernelError> {
    let src = input.type_id();
    let dst = result.type_id();

    prepare_result(input, result);
    result.null_mask_mut().copy_from(input.null_mask());

    if src == dst {
        let elem_size = src.size();
        unsafe {
            std::ptr::copy_nonoverlapping(
                input.data(),
                result.data_mut(),
                input.size() * elem_size,
            );
        }
        return Ok(());
    }

    match (src, dst) {
        (TypeId::Date, TypeId::Timestamp) => {
            let values = input.values::<Date>();
            let out = result.values_mut::<Timestamp>().as_mut_ptr();
            input.for_each_active(|i| unsafe {
                *out.add(i) = Timestamp(i64::from(values[i].0) * MICROS_PER_DAY);
            });
            Ok(())
        }
        (TypeId::Timestamp, TypeId::Date) => {
            let values = input.values::<Timestamp>();
            let out = result.values_mut::<Date>().as_mut_ptr();
            input.for_each_active(|i| unsafe {
                *out.add(i) = Date(values[i].0.div_euclid(MICROS_PER_DAY) as i32);
            });
            Ok(())
        }
        (TypeId::Boolean, _) if dst.is_integral() => {
            let values = input.values::<bool>();
            macro_rules! bool_to_int {
                ($dst:ty) => {{
                    let out = result.values_mut::<$dst>().as_mut_ptr();
                    input.for_each_active(|i| unsafe { *out.add(i) = values[i] as $dst });
                }};
            }
            match dst {
                TypeId::TinyInt => bool_to_int!(i8),
                TypeId::SmallInt => bool_to_int!(i16),
                TypeId::Integer => bool_to_int!(i32),
                TypeId::BigInt => bool_to_int!(i64),
                _ => unreachable!(),
            }
            Ok(())
        }
        (TypeId::Varchar, _) => match dst {
            TypeId::Boolean => templated_parse_cast::<bool>(input, result),
            TypeId::TinyInt => templated_parse_cast::<i8>(input, result),
            TypeId::SmallInt => templated_parse_cast::<i16>(input, result),
            TypeId::Integer => templated_parse_cast::<i32>(input, result),
            TypeId::BigInt => templated_parse_cast::<i64>(input, result),
            TypeId::Float => templated_parse_cast::<f32>(input, result),
            TypeId::Double => templated_parse_cast::<f64>(input, result),
            TypeId::Date => templated_parse_cast::<Date>(input, result),
            TypeId::Timestamp => templated_parse_cast::<Timestamp>(input, result),
            other => Err(KernelError::UnsupportedType {
                op: "cast",
                type_id: other,
            }),
        },
        _ if src.is_numeric() => {
            match src {
                TypeId::TinyInt => dispatch_numeric_src!(i8, dst, input, result),
                TypeId::SmallInt => dispatch_numeric_src!(i16, dst, input, result),
                TypeId::Integer => dispatch_numeric_src!(i32, dst, input, result),
                TypeId::BigInt => dispatch_numeric_src!(i64, dst, input, result),
                TypeId::Float => dispatch_numeric_src!(f32, dst, input, result),
                TypeId::Double => dispatch_numeric_src!(f64, dst, input, result),
                _ => unreachable!(),
            }
            Ok(())
        }
        _ => Err(KernelError::UnsupportedType {
            op: "cast",
            type_id: src,
        }),
    }
}
