//! Parameter update rules.
//!
//! An [`Optimizer`] is attached to one operation and receives that
//! operation's parameters, each with its averaged gradient, once per
//! [`FunctionRef::update`](crate::FunctionRef::update). Auxiliary state is
//! kept per parameter position and sized lazily on the first step.

use crate::Real;
use crate::error::Result;
use crate::tensors::NdArray;

/// A gradient-based update rule.
pub trait Optimizer {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Updates every parameter's data in place from its gradient.
    ///
    /// # Errors
    ///
    /// Implementations may reject parameters they cannot handle.
    fn step(&mut self, params: &[NdArray]) -> Result<()>;

    /// Drops auxiliary state.
    fn reset(&mut self);
}

/// Produces a fresh optimizer for each operation in a container.
pub type OptimizerFactory<'a> = &'a dyn Fn() -> Box<dyn Optimizer>;

fn sized(state: &mut Vec<Vec<Real>>, params: &[NdArray]) {
    let fits = state.len() == params.len()
        && state.iter().zip(params).all(|(s, p)| s.len() == p.total_len());
    if !fits {
        *state = params.iter().map(|p| vec![0.0; p.total_len()]).collect();
    }
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    /// Learning rate.
    pub lr: Real,
    /// Momentum factor; `0` disables the velocity buffer.
    pub momentum: Real,
    velocity: Vec<Vec<Real>>,
}

impl Sgd {
    /// Plain SGD.
    #[must_use]
    pub fn new(lr: Real) -> Self {
        Self::with_momentum(lr, 0.0)
    }

    /// SGD with momentum.
    #[must_use]
    pub fn with_momentum(lr: Real, momentum: Real) -> Self {
        Self {
            lr,
            momentum,
            velocity: Vec::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn step(&mut self, params: &[NdArray]) -> Result<()> {
        if self.momentum == 0.0 {
            for p in params {
                let grad = p.grad_to_vec();
                for (w, g) in p.data_mut().iter_mut().zip(grad) {
                    *w -= self.lr * g;
                }
            }
            return Ok(());
        }

        sized(&mut self.velocity, params);
        for (p, v) in params.iter().zip(&mut self.velocity) {
            let grad = p.grad_to_vec();
            for ((w, g), vel) in p.data_mut().iter_mut().zip(grad).zip(v.iter_mut()) {
                *vel = self.momentum * *vel + g;
                *w -= self.lr * *vel;
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.velocity.clear();
    }
}

/// Adam with bias-corrected moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    /// Learning rate.
    pub lr: Real,
    /// First moment decay.
    pub beta1: Real,
    /// Second moment decay.
    pub beta2: Real,
    /// Denominator guard.
    pub eps: Real,
    m: Vec<Vec<Real>>,
    v: Vec<Vec<Real>>,
    t: i32,
}

impl Adam {
    /// Adam with `beta1 = 0.9`, `beta2 = 0.999`, `eps = 1e-8`.
    #[must_use]
    pub fn new(lr: Real) -> Self {
        Self::with_params(lr, 0.9, 0.999, 1e-8)
    }

    /// Adam with explicit hyperparameters.
    #[must_use]
    pub fn with_params(lr: Real, beta1: Real, beta2: Real, eps: Real) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn step(&mut self, params: &[NdArray]) -> Result<()> {
        sized(&mut self.m, params);
        sized(&mut self.v, params);
        self.t = self.t.saturating_add(1);
        let c1 = 1.0 - self.beta1.powi(self.t);
        let c2 = 1.0 - self.beta2.powi(self.t);

        for ((p, m), v) in params.iter().zip(&mut self.m).zip(&mut self.v) {
            let grad = p.grad_to_vec();
            let mut data = p.data_mut();
            for (i, g) in grad.into_iter().enumerate() {
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                let m_hat = m[i] / c1;
                let v_hat = v[i] / c2;
                data[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.m.clear();
        self.v.clear();
        self.t = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(data: Vec<Real>, grad: &[Real]) -> NdArray {
        let p = NdArray::from_vec(&[data.len()], data).unwrap();
        p.grad_mut().copy_from_slice(grad);
        p
    }

    #[test]
    fn sgd_steps_against_gradient() {
        let p = param(vec![1.0, 2.0], &[0.5, -1.0]);
        Sgd::new(0.1).step(&[p.clone()]).unwrap();
        let d = p.to_vec();
        assert!((d[0] - 0.95).abs() < 1e-6 && (d[1] - 2.1).abs() < 1e-6);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let p = param(vec![0.0], &[1.0]);
        let mut opt = Sgd::with_momentum(1.0, 0.5);
        opt.step(&[p.clone()]).unwrap();
        opt.step(&[p.clone()]).unwrap();
        // velocities 1.0 then 1.5
        assert!((p.to_vec()[0] + 2.5).abs() < 1e-6);
        opt.reset();
        opt.step(&[p.clone()]).unwrap();
        assert!((p.to_vec()[0] + 3.5).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_is_lr_sized() {
        let p = param(vec![1.0, 2.0], &[0.1, -0.2]);
        Adam::new(0.01).step(&[p.clone()]).unwrap();
        let d = p.to_vec();
        assert!((d[0] - 0.99).abs() < 1e-4);
        assert!((d[1] - 2.01).abs() < 1e-4);
    }
}
