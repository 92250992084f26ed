use crate::error::IntegrationError;
use crate::traits::{Rhs, Steppable};

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RK4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for RK4 {
    fn step(
        &mut self,
        system: &mut impl Rhs,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), IntegrationError> {
        let t0 = *t;

        // k1 = f(t, y)
        system.eval(t0, state, &mut self.k1)?;

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * 0.5;
        }
        system.eval(t0 + dt * 0.5, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * 0.5;
        }
        system.eval(t0 + dt * 0.5, &self.tmp, &mut self.k3)?;

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.eval(t0 + dt, &self.tmp, &mut self.k4)?;

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] += dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
        Ok(())
    }
}

/// Tsitouras 5/4 Solver, used here at a fixed step.
pub struct Tsit5 {
    k: [Vec<f64>; 6],
    tmp: Vec<f64>,
}

impl Tsit5 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
        }
    }
}

const TSIT5_C: [f64; 6] = [0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0];

const TSIT5_A: [[f64; 5]; 6] = [
    [0.0, 0.0, 0.0, 0.0, 0.0],
    [0.161, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0],
    [2.898, -6.359447987781783, 4.361447987781783, 0.0, 0.0],
    [
        5.325864858437957,
        -11.748883564062828,
        7.495539342889693,
        -0.09249506636030195,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.02826857949054663,
    ],
];

// 5th order weights
const TSIT5_B: [f64; 6] = [
    0.09646076681806523,
    0.01,
    0.4798896504144996,
    1.379008574103742,
    -3.290069515436099,
    2.324710524099774,
];

impl Steppable for Tsit5 {
    fn step(
        &mut self,
        system: &mut impl Rhs,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), IntegrationError> {
        let t0 = *t;
        let n = state.len();

        for stage in 0..6 {
            for i in 0..n {
                let mut acc = 0.0;
                for j in 0..stage {
                    acc += TSIT5_A[stage][j] * self.k[j][i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            let (_, rest) = self.k.split_at_mut(stage);
            system.eval(t0 + TSIT5_C[stage] * dt, &self.tmp, &mut rest[0])?;
        }

        for i in 0..n {
            let mut acc = 0.0;
            for (b, k) in TSIT5_B.iter().zip(&self.k) {
                acc += b * k[i];
            }
            state[i] += dt * acc;
        }

        *t = t0 + dt;
        Ok(())
    }
}

// Dormand-Prince 5(4) tableau.
const DP_C: [f64; 7] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0, 1.0];

const DP_A: [[f64; 6]; 7] = [
    [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
        0.0,
    ],
    // Row 7 equals the 5th order weights (FSAL).
    [
        35.0 / 384.0,
        0.0,
        500.0 / 1113.0,
        125.0 / 192.0,
        -2187.0 / 6784.0,
        11.0 / 84.0,
    ],
];

// Difference between the 5th and 4th order weights.
const DP_E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

// Continuous extension coefficients.
const DP_D: [f64; 7] = [
    -12715105075.0 / 11282082432.0,
    0.0,
    87487479700.0 / 32700410799.0,
    -10690763975.0 / 1880347072.0,
    701980252875.0 / 199316789632.0,
    -1453857185.0 / 822651844.0,
    69997945.0 / 29380423.0,
];

/// Outcome of one attempted adaptive step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepAttempt {
    /// Scaled RMS error; the step is acceptable when this is `<= 1`.
    pub error_norm: f64,
}

/// Dormand-Prince 5(4) embedded pair with FSAL and dense output.
///
/// Usage: `prime` once at the initial point, then `attempt` a step; if the
/// error is acceptable call `accept`, after which `interpolate` covers the
/// completed step.
pub struct DormandPrince45 {
    k: [Vec<f64>; 7],
    tmp: Vec<f64>,
    y_new: Vec<f64>,
    // Dense output: y(t_old + s*h) = r0 + s*(r1 + (1-s)*(r2 + s*(r3 + (1-s)*r4)))
    cont: [Vec<f64>; 5],
    t_old: f64,
    h_old: f64,
    primed: bool,
}

impl DormandPrince45 {
    pub fn new(dim: usize) -> Self {
        Self {
            k: std::array::from_fn(|_| vec![0.0; dim]),
            tmp: vec![0.0; dim],
            y_new: vec![0.0; dim],
            cont: std::array::from_fn(|_| vec![0.0; dim]),
            t_old: 0.0,
            h_old: 0.0,
            primed: false,
        }
    }

    /// Evaluates the first stage at the initial point.
    pub fn prime(&mut self, system: &mut impl Rhs, t: f64, y: &[f64]) -> Result<(), IntegrationError> {
        system.eval(t, y, &mut self.k[0])?;
        self.primed = true;
        Ok(())
    }

    /// Derivative at the current point (valid after `prime`/`accept`).
    pub fn derivative(&self) -> &[f64] {
        &self.k[0]
    }

    /// Computes a trial step of size `h` from `(t, y)` and its error estimate.
    pub fn attempt(
        &mut self,
        system: &mut impl Rhs,
        t: f64,
        y: &[f64],
        h: f64,
        atol: f64,
        rtol: f64,
    ) -> Result<StepAttempt, IntegrationError> {
        if !self.primed {
            self.prime(system, t, y)?;
        }
        let n = y.len();

        for stage in 1..7 {
            for i in 0..n {
                let mut acc = 0.0;
                for j in 0..stage {
                    acc += DP_A[stage][j] * self.k[j][i];
                }
                self.tmp[i] = y[i] + h * acc;
            }
            if stage == 6 {
                self.y_new.copy_from_slice(&self.tmp);
            }
            let (_, rest) = self.k.split_at_mut(stage);
            system.eval(t + DP_C[stage] * h, &self.tmp, &mut rest[0])?;
        }

        let mut sum = 0.0;
        for i in 0..n {
            let mut err = 0.0;
            for (e, k) in DP_E.iter().zip(&self.k) {
                err += e * k[i];
            }
            err *= h;
            let scale = atol + rtol * y[i].abs().max(self.y_new[i].abs());
            sum += (err / scale) * (err / scale);
        }
        let error_norm = if n == 0 { 0.0 } else { (sum / n as f64).sqrt() };

        Ok(StepAttempt { error_norm })
    }

    /// Commits the last attempted step: builds the dense output for
    /// `[t, t + h]`, writes the new state into `y` and shifts the FSAL stage.
    pub fn accept(&mut self, t: f64, y: &mut [f64], h: f64) {
        for i in 0..y.len() {
            let y0 = y[i];
            let y1 = self.y_new[i];
            let dy = y1 - y0;
            let bspl = h * self.k[0][i] - dy;
            let mut d = 0.0;
            for (coef, k) in DP_D.iter().zip(&self.k) {
                d += coef * k[i];
            }
            self.cont[0][i] = y0;
            self.cont[1][i] = dy;
            self.cont[2][i] = bspl;
            self.cont[3][i] = dy - h * self.k[6][i] - bspl;
            self.cont[4][i] = h * d;
            y[i] = y1;
        }
        self.t_old = t;
        self.h_old = h;
        let (first, rest) = self.k.split_at_mut(6);
        std::mem::swap(&mut first[0], &mut rest[0]);
    }

    /// Evaluates the continuous extension of the last accepted step at `t`.
    pub fn interpolate(&self, t: f64, out: &mut [f64]) {
        let s = if self.h_old == 0.0 {
            1.0
        } else {
            (t - self.t_old) / self.h_old
        };
        let s1 = 1.0 - s;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.cont[0][i]
                + s * (self.cont[1][i]
                    + s1 * (self.cont[2][i] + s * (self.cont[3][i] + s1 * self.cont[4][i])));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay {
        rate: f64,
        evaluations: usize,
    }

    impl Rhs for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn eval(&mut self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<(), IntegrationError> {
            self.evaluations += 1;
            out[0] = -self.rate * x[0];
            Ok(())
        }
    }

    struct Oscillator;

    impl Rhs for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn eval(&mut self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<(), IntegrationError> {
            out[0] = x[1];
            out[1] = -x[0];
            Ok(())
        }
    }

    #[test]
    fn rk4_tracks_exponential_decay() {
        let mut system = Decay {
            rate: 1.0,
            evaluations: 0,
        };
        let mut solver = RK4::new(1);
        let mut t = 0.0;
        let mut y = [1.0];
        for _ in 0..100 {
            solver.step(&mut system, &mut t, &mut y, 0.01).unwrap();
        }
        assert!((t - 1.0).abs() < 1e-12);
        assert!((y[0] - (-1.0f64).exp()).abs() < 1e-9);
        assert_eq!(system.evaluations, 400);
    }

    #[test]
    fn tsit5_tracks_harmonic_oscillator() {
        let mut solver = Tsit5::new(2);
        let mut t = 0.0;
        let mut y = [1.0, 0.0];
        for _ in 0..200 {
            solver.step(&mut Oscillator, &mut t, &mut y, 0.01).unwrap();
        }
        assert!((y[0] - 2.0f64.cos()).abs() < 1e-9);
        assert!((y[1] + 2.0f64.sin()).abs() < 1e-9);
    }

    #[test]
    fn dormand_prince_step_is_accurate_and_dense_output_matches_endpoints() {
        let mut system = Oscillator;
        let mut solver = DormandPrince45::new(2);
        let mut y = [1.0, 0.0];
        let h = 0.1;
        solver.prime(&mut system, 0.0, &y).unwrap();
        let attempt = solver.attempt(&mut system, 0.0, &y, h, 1e-6, 1e-6).unwrap();
        assert!(attempt.error_norm < 1.0);
        solver.accept(0.0, &mut y, h);

        assert!((y[0] - h.cos()).abs() < 1e-8);
        assert!((y[1] + h.sin()).abs() < 1e-8);

        let mut out = [0.0; 2];
        solver.interpolate(0.0, &mut out);
        assert_eq!(out, [1.0, 0.0]);
        solver.interpolate(h, &mut out);
        assert!((out[0] - y[0]).abs() < 1e-14);
        assert!((out[1] - y[1]).abs() < 1e-14);
        solver.interpolate(0.05, &mut out);
        assert!((out[0] - 0.05f64.cos()).abs() < 1e-6);
        assert!((out[1] + 0.05f64.sin()).abs() < 1e-6);

        // FSAL: the stored derivative now belongs to the new point.
        assert!((solver.derivative()[0] - y[1]).abs() < 1e-14);
        assert!((solver.derivative()[1] + y[0]).abs() < 1e-14);
    }

    #[test]
    fn dormand_prince_error_grows_with_step_size() {
        let mut system = Decay {
            rate: 5.0,
            evaluations: 0,
        };
        let mut solver = DormandPrince45::new(1);
        let y = [1.0];
        let small = solver.attempt(&mut system, 0.0, &y, 0.01, 1e-6, 1e-6).unwrap();
        let large = solver.attempt(&mut system, 0.0, &y, 0.5, 1e-6, 1e-6).unwrap();
        assert!(small.error_norm < 1.0);
        assert!(large.error_norm > 1.0);
        assert!(large.error_norm > small.error_norm);
    }
}
