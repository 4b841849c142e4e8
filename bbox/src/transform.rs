use super::{Rect, TLBR};
use crate::{common::*, RectNum, HW};

/// Axis-aligned scale-and-shift transform, `y' = y * sy + ty` and
/// `x' = x * sx + tx`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Transform<T> {
    pub sy: T,
    pub sx: T,
    pub ty: T,
    pub tx: T,
}

impl<T> Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    pub fn from_rects<R>(src: &R, tgt: &R) -> Self
    where
        R: Rect<Type = T>,
    {
        let sy = tgt.h() / src.h();
        let sx = tgt.w() / src.w();
        let ty = tgt.t() - src.t() * sy;
        let tx = tgt.l() - src.l() * sx;

        Self { sy, sx, ty, tx }
    }

    /// The transform that stretches an image of `src_size` onto `tgt_size`.
    pub fn from_sizes_exact(src_size: &HW<T>, tgt_size: &HW<T>) -> Self {
        let src = TLBR::from_tlhw([T::zero(), T::zero(), src_size.h(), src_size.w()]);
        let tgt = TLBR::from_tlhw([T::zero(), T::zero(), tgt_size.h(), tgt_size.w()]);
        Self::from_rects(&src, &tgt)
    }
}

impl<T> Transform<T>
where
    T: Copy + Num + PartialOrd + Neg<Output = T>,
{
    /// Mirrors the horizontal axis of an image `width` pixels wide.
    pub fn horizontal_flip(width: T) -> Self {
        Self {
            sy: T::one(),
            sx: -T::one(),
            ty: T::zero(),
            tx: width,
        }
    }
}

impl<T> Mul<&TLBR<T>> for &Transform<T>
where
    T: Copy + Num + PartialOrd,
{
    type Output = TLBR<T>;

    fn mul(self, rhs: &TLBR<T>) -> Self::Output {
        rhs.transform(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_resize_exact() {
        let transform =
            Transform::from_sizes_exact(&HW::from_hw([80.0, 80.0]), &HW::from_hw([20.0, 40.0]));
        let expect = Transform {
            sx: 0.5,
            sy: 0.25,
            tx: 0.0,
            ty: 0.0,
        };
        assert_eq!(transform, expect);
    }

    #[test]
    fn horizontal_flip_mirrors_box() {
        let flip = Transform::horizontal_flip(100.0);
        let rect = TLBR::from_tlbr([10.0, 20.0, 30.0, 50.0]);
        let flipped = &flip * &rect;
        assert_eq!(flipped.xyxy(), [50.0, 10.0, 80.0, 30.0]);
        assert_eq!(&flip * &flipped, rect);
    }
}
