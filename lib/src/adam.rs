//! Adam optimizer over the pixels of an image tensor.

use crate::{Error, ImageTensor};
use ndarray::{Array4, Zip};

/// The result of a single optimizer step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Every pixel was updated
    Applied,
    /// The update contained non-finite values, the parameters were left as is
    NonFinite,
}

/// Adam with bias-corrected first and second moment estimates. The moment
/// buffers have the shape of the optimized tensor and live for one run.
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: u32,
    m: Array4<f32>,
    v: Array4<f32>,
    update: Array4<f32>,
}

impl Adam {
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32, shape: (usize, usize, usize, usize)) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            t: 0,
            m: Array4::zeros(shape),
            v: Array4::zeros(shape),
            update: Array4::zeros(shape),
        }
    }

    /// The number of steps taken so far
    pub fn steps(&self) -> u32 {
        self.t
    }

    /// Moves `params` against `grads`. The update is computed in full before
    /// any parameter is touched, so a non-finite update leaves `params` intact.
    pub fn step(&mut self, params: &mut ImageTensor, grads: &ImageTensor) -> Result<Step, Error> {
        if params.shape() != self.m.shape() || grads.shape() != self.m.shape() {
            return Err(Error::shape_mismatch(
                "optimizer parameters",
                self.m.shape(),
                if params.shape() != self.m.shape() {
                    params.shape()
                } else {
                    grads.shape()
                },
            ));
        }

        self.t += 1;
        let t = self.t as i32;
        let (b1, b2, lr, eps) = (self.beta1, self.beta2, self.lr, self.eps);

        let bias1 = 1.0 - b1.powi(t);
        let bias2 = 1.0 - b2.powi(t);

        Zip::from(&mut self.m)
            .and(&mut self.v)
            .and(&mut self.update)
            .and(grads)
            .for_each(|m, v, update, &g| {
                *m = *m * b1 + g * (1.0 - b1);
                *v = *v * b2 + g * g * (1.0 - b2);

                let m_hat = *m / bias1;
                let v_hat = *v / bias2;

                *update = lr * m_hat / (v_hat.sqrt() + eps);
            });

        if !self.update.iter().all(|u| u.is_finite()) {
            return Ok(Step::NonFinite);
        }

        params.zip_mut_with(&self.update, |p, &u| *p -= u);
        Ok(Step::Applied)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn moves_against_gradient() {
        let mut opt = Adam::new(0.01, 0.9, 0.999, 1e-8, (1, 2, 1, 1));
        let mut params = ImageTensor::from_elem((1, 2, 1, 1), 1.0);
        let grads = ImageTensor::from_shape_vec((1, 2, 1, 1), vec![1.0, -1.0]).unwrap();

        assert_eq!(opt.step(&mut params, &grads).unwrap(), Step::Applied);
        assert_eq!(opt.steps(), 1);

        // the first bias-corrected step is lr * sign(g)
        assert!((params[[0, 0, 0, 0]] - 0.99).abs() < 1e-5);
        assert!((params[[0, 1, 0, 0]] - 1.01).abs() < 1e-5);
    }

    #[test]
    fn non_finite_update_is_not_applied() {
        let mut opt = Adam::new(0.01, 0.9, 0.999, 1e-8, (1, 1, 1, 1));
        let mut params = ImageTensor::from_elem((1, 1, 1, 1), 0.5);
        let grads = ImageTensor::from_elem((1, 1, 1, 1), f32::NAN);

        assert_eq!(opt.step(&mut params, &grads).unwrap(), Step::NonFinite);
        assert_eq!(params[[0, 0, 0, 0]], 0.5);
    }

    #[test]
    fn rejects_shape_mismatch() {
        let mut opt = Adam::new(0.01, 0.9, 0.999, 1e-8, (1, 1, 3, 1));
        let mut params = ImageTensor::zeros((1, 2, 3, 1));
        let grads = ImageTensor::zeros((1, 2, 3, 1));

        assert!(opt.step(&mut params, &grads).is_err());
    }
}
